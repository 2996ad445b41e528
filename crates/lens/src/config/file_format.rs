use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ConfigFile {
    #[serde(rename = "mcpServers")]
    pub(super) mcp_servers: BTreeMap<String, ServerEntryFile>,
    #[serde(rename = "proxySettings", default)]
    pub(super) proxy_settings: Option<ProxySettingsFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ServerEntryFile {
    pub(super) command: String,
    #[serde(default)]
    pub(super) args: Vec<String>,
    #[serde(default)]
    pub(super) env: BTreeMap<String, String>,
    #[serde(rename = "startupTimeoutMs", default)]
    pub(super) startup_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ProxySettingsFile {
    #[serde(rename = "maxResponseSize", default)]
    pub(super) max_response_size: Option<u64>,
    #[serde(rename = "cacheMaxEntries", default)]
    pub(super) cache_max_entries: Option<u64>,
    #[serde(rename = "cacheTTLSeconds", default)]
    pub(super) cache_ttl_seconds: Option<u64>,
    #[serde(rename = "enableAutoTruncation", default)]
    pub(super) enable_auto_truncation: Option<bool>,
    #[serde(rename = "cacheMaxBytesPerAgent", default)]
    pub(super) cache_max_bytes_per_agent: Option<u64>,
    #[serde(rename = "cacheMaxAgents", default)]
    pub(super) cache_max_agents: Option<u64>,
    #[serde(rename = "requestTimeoutMs", default)]
    pub(super) request_timeout_ms: Option<u64>,
    #[serde(rename = "shutdownGraceMs", default)]
    pub(super) shutdown_grace_ms: Option<u64>,
}
