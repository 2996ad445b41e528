use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::upstream_name::UpstreamName;

pub(super) const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Declarative description of one upstream server. Immutable after load.
#[derive(Debug, Clone)]
pub struct UpstreamSpec {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    startup_timeout: Duration,
}

impl UpstreamSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> anyhow::Result<Self> {
        let spec = Self {
            command: command.into(),
            args,
            env: BTreeMap::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.command.trim().is_empty() {
            anyhow::bail!("upstream command must not be empty");
        }
        for (idx, arg) in self.args.iter().enumerate() {
            if arg.is_empty() {
                anyhow::bail!("upstream args[{idx}] must not be empty");
            }
        }
        for key in self.env.keys() {
            if key.trim().is_empty() {
                anyhow::bail!("upstream env key must not be empty");
            }
        }
        if self.startup_timeout.is_zero() {
            anyhow::bail!("upstream startupTimeoutMs must be > 0");
        }
        Ok(())
    }
}

/// Runtime settings for the proxy itself, loaded from the optional
/// `proxySettings` key in `mcp.json`.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Character threshold above which a response is auto-truncated and cached.
    pub max_response_size: usize,
    /// Maximum number of cache entries per agent.
    pub cache_max_entries: usize,
    /// Time-to-live for cache entries.
    pub cache_ttl: Duration,
    /// Whether to automatically truncate + cache large responses.
    pub enable_auto_truncation: bool,
    /// Maximum cached bytes per agent.
    pub cache_max_bytes_per_agent: usize,
    /// Maximum number of concurrently tracked agents.
    pub cache_max_agents: usize,
    /// Per upstream tool-call deadline.
    pub request_timeout: Duration,
    /// Bounded grace period for session shutdown before forceful kill.
    pub shutdown_grace: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            max_response_size: 8000,
            cache_max_entries: 50,
            cache_ttl: Duration::from_secs(300),
            enable_auto_truncation: true,
            cache_max_bytes_per_agent: 100 * 1024 * 1024,
            cache_max_agents: 1000,
            request_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl ProxySettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_response_size == 0 {
            anyhow::bail!("proxySettings.maxResponseSize must be > 0");
        }
        if self.cache_max_entries == 0 {
            anyhow::bail!("proxySettings.cacheMaxEntries must be > 0");
        }
        if self.cache_ttl.is_zero() {
            anyhow::bail!("proxySettings.cacheTTLSeconds must be > 0");
        }
        if self.cache_max_bytes_per_agent == 0 {
            anyhow::bail!("proxySettings.cacheMaxBytesPerAgent must be > 0");
        }
        if self.cache_max_agents == 0 {
            anyhow::bail!("proxySettings.cacheMaxAgents must be > 0");
        }
        if self.request_timeout.is_zero() {
            anyhow::bail!("proxySettings.requestTimeoutMs must be > 0");
        }
        if self.shutdown_grace.is_zero() {
            anyhow::bail!("proxySettings.shutdownGraceMs must be > 0");
        }
        Ok(())
    }
}

/// Root configuration: upstream specs plus proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub(super) path: Option<PathBuf>,
    pub(super) upstreams: BTreeMap<UpstreamName, UpstreamSpec>,
    pub(super) settings: ProxySettings,
}

impl ProxyConfig {
    pub fn new(upstreams: BTreeMap<UpstreamName, UpstreamSpec>, settings: ProxySettings) -> Self {
        Self {
            path: None,
            upstreams,
            settings,
        }
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn upstreams(&self) -> &BTreeMap<UpstreamName, UpstreamSpec> {
        &self.upstreams
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.settings.validate()?;
        for (name, spec) in self.upstreams.iter() {
            spec.validate()
                .map_err(|err| err.context(format!("invalid upstream config (upstream={name})")))?;
        }
        Ok(())
    }
}
