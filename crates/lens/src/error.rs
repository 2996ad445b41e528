use serde_json::Value;

/// Errors surfaced to the proxy's client.
///
/// Every variant carries a human-readable message; `Display` is the text the
/// client sees in tool error results.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("upstream unavailable: {upstream}: {reason}")]
    UpstreamUnavailable { upstream: String, reason: String },

    #[error("upstream crashed: {upstream}")]
    UpstreamCrashed { upstream: String },

    #[error("upstream call timed out after {timeout_ms}ms: {upstream}")]
    UpstreamTimeout { upstream: String, timeout_ms: u64 },

    #[error("upstream error: {message}")]
    UpstreamError {
        message: String,
        data: Option<Value>,
    },

    #[error("cache miss: {0}")]
    CacheMiss(String),

    #[error("cache entry expired: {0}")]
    CacheExpired(String),

    #[error("cache full: {0}")]
    CacheFull(String),

    #[error("too many agents: limit of {0} reached")]
    TooManyAgents(usize),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("processor error: {0}")]
    ProcessorError(String),
}

impl ProxyError {
    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::BadArguments(message.into())
    }
}
