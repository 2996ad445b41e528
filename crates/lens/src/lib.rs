mod cache;
mod config;
mod error;
mod frontend;
mod intercept;
mod mcp;
mod pool;
mod processors;
mod proxy_tools;
mod stats;
mod upstream_name;

pub use cache::{CacheHandle, CacheLookup, CacheStatsSnapshot, ResponseCache};
pub use config::{ProxyConfig, ProxySettings, UpstreamSpec};
pub use error::ProxyError;
pub use frontend::{Dispatcher, Frontend, DEFAULT_AGENT_ID};
pub use intercept::{intercept_response, TRUNCATION_TRAILER_PREFIX};
pub use mcp::{Tool, MCP_PROTOCOL_VERSION, PROXY_SERVER_NAME, PROXY_SERVER_VERSION};
pub use pool::{PoolStats, SessionHealth, UpstreamPool};
pub use processors::{Pipeline, Processor, ProcessorResult};
pub use proxy_tools::{proxy_tool_descriptors, run_proxy_tool, PROXY_TOOL_PREFIX};
pub use stats::{ProxyStats, ProxyStatsSnapshot};
pub use upstream_name::{QualifiedName, UpstreamName, UpstreamNameError};
