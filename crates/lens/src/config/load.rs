use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use super::file_format::{ConfigFile, ProxySettingsFile, ServerEntryFile};
use super::model::DEFAULT_STARTUP_TIMEOUT;
use super::{ProxyConfig, ProxySettings, UpstreamSpec};
use crate::upstream_name::UpstreamName;

async fn read_to_string_limited(path: &Path) -> anyhow::Result<String> {
    let meta = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    if !meta.file_type().is_file() {
        anyhow::bail!("config must be a regular file: {}", path.display());
    }
    if meta.len() > super::MAX_CONFIG_BYTES {
        anyhow::bail!(
            "config too large: {} bytes (max {}): {}",
            meta.len(),
            super::MAX_CONFIG_BYTES,
            path.display()
        );
    }

    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))
}

impl ProxyConfig {
    /// Load `mcp.json`.
    ///
    /// With an explicit `override_path` the file must exist. Without one, a
    /// missing `mcp.json` in `dir` yields an empty config (no upstreams,
    /// default settings) so the proxy can start degraded.
    pub async fn load(dir: &Path, override_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (path, contents) = match override_path {
            Some(path) => {
                let path = if path.is_absolute() {
                    path
                } else {
                    dir.join(path)
                };
                let contents = read_to_string_limited(&path).await?;
                (path, contents)
            }
            None => {
                let path = dir.join(super::DEFAULT_CONFIG_FILE);
                match tokio::fs::symlink_metadata(&path).await {
                    Ok(_) => {
                        let contents = read_to_string_limited(&path).await?;
                        (path, contents)
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(Self {
                            path: None,
                            upstreams: BTreeMap::new(),
                            settings: ProxySettings::default(),
                        });
                    }
                    Err(err) => {
                        return Err(err).with_context(|| format!("stat {}", path.display()));
                    }
                }
            }
        };

        let cfg = Self::parse(&contents).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg.with_path(path))
    }

    /// Parse and validate an `mcp.json` document.
    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = serde_json::from_str(contents).context("invalid mcp.json")?;

        let mut upstreams = BTreeMap::<UpstreamName, UpstreamSpec>::new();
        for (name, entry) in file.mcp_servers {
            let upstream_name = UpstreamName::parse(&name)
                .map_err(|err| anyhow::anyhow!("invalid upstream name {name:?}: {err}"))?;
            if upstream_name.as_str() == "proxy" {
                anyhow::bail!("upstream name \"proxy\" is reserved for the proxy tools");
            }
            let spec = build_spec(&upstream_name, entry)?;
            upstreams.insert(upstream_name, spec);
        }

        let settings = match file.proxy_settings {
            Some(settings) => build_settings(settings)?,
            None => ProxySettings::default(),
        };

        let cfg = Self {
            path: None,
            upstreams,
            settings,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

fn build_spec(name: &UpstreamName, entry: ServerEntryFile) -> anyhow::Result<UpstreamSpec> {
    let spec = UpstreamSpec::new(entry.command, entry.args)
        .map_err(|err| err.context(format!("invalid upstream config (upstream={name})")))?
        .with_env(entry.env);
    let spec = match entry.startup_timeout_ms {
        Some(0) => anyhow::bail!("upstream {name}: startupTimeoutMs must be > 0"),
        Some(ms) => spec.with_startup_timeout(Duration::from_millis(ms)),
        None => spec.with_startup_timeout(DEFAULT_STARTUP_TIMEOUT),
    };
    Ok(spec)
}

fn build_settings(file: ProxySettingsFile) -> anyhow::Result<ProxySettings> {
    let defaults = ProxySettings::default();

    fn positive(name: &str, value: Option<u64>, default: usize) -> anyhow::Result<usize> {
        match value {
            Some(0) => anyhow::bail!("proxySettings.{name} must be > 0"),
            Some(v) => usize::try_from(v)
                .map_err(|_| anyhow::anyhow!("proxySettings.{name} out of range: {v}")),
            None => Ok(default),
        }
    }

    fn positive_duration(
        name: &str,
        value: Option<u64>,
        default: Duration,
        unit: fn(u64) -> Duration,
    ) -> anyhow::Result<Duration> {
        match value {
            Some(0) => anyhow::bail!("proxySettings.{name} must be > 0"),
            Some(v) => Ok(unit(v)),
            None => Ok(default),
        }
    }

    Ok(ProxySettings {
        max_response_size: positive(
            "maxResponseSize",
            file.max_response_size,
            defaults.max_response_size,
        )?,
        cache_max_entries: positive(
            "cacheMaxEntries",
            file.cache_max_entries,
            defaults.cache_max_entries,
        )?,
        cache_ttl: positive_duration(
            "cacheTTLSeconds",
            file.cache_ttl_seconds,
            defaults.cache_ttl,
            Duration::from_secs,
        )?,
        enable_auto_truncation: file
            .enable_auto_truncation
            .unwrap_or(defaults.enable_auto_truncation),
        cache_max_bytes_per_agent: positive(
            "cacheMaxBytesPerAgent",
            file.cache_max_bytes_per_agent,
            defaults.cache_max_bytes_per_agent,
        )?,
        cache_max_agents: positive(
            "cacheMaxAgents",
            file.cache_max_agents,
            defaults.cache_max_agents,
        )?,
        request_timeout: positive_duration(
            "requestTimeoutMs",
            file.request_timeout_ms,
            defaults.request_timeout,
            Duration::from_millis,
        )?,
        shutdown_grace: positive_duration(
            "shutdownGraceMs",
            file.shutdown_grace_ms,
            defaults.shutdown_grace,
            Duration::from_millis,
        )?,
    })
}
