//! Client-facing MCP frontend and tool-call routing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;

use crate::cache::ResponseCache;
use crate::config::{ProxySettings, UpstreamSpec};
use crate::error::ProxyError;
use crate::intercept::intercept_response;
use crate::mcp::{
    CallToolResult, Tool, MCP_PROTOCOL_VERSION, PROXY_SERVER_NAME, PROXY_SERVER_VERSION,
};
use crate::pool::UpstreamPool;
use crate::proxy_tools::{proxy_tool_descriptors, run_proxy_tool, PROXY_TOOL_PREFIX};
use crate::stats::ProxyStats;
use crate::upstream_name::UpstreamName;

/// Agent id assigned to the single stdio client.
pub const DEFAULT_AGENT_ID: &str = "agent_1";

const JSONRPC_INVALID_PARAMS: i64 = -32602;
const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;

/// Routes client tool calls to the proxy tools or to the session pool, and
/// pipes upstream results through the response interceptor.
#[derive(Clone)]
pub struct Dispatcher {
    pool: UpstreamPool,
    cache: Arc<ResponseCache>,
    settings: Arc<ProxySettings>,
    stats: ProxyStats,
}

impl Dispatcher {
    pub fn new(specs: &BTreeMap<UpstreamName, UpstreamSpec>, settings: ProxySettings) -> Self {
        let stats = ProxyStats::new();
        let cache = Arc::new(ResponseCache::new(
            settings.cache_max_entries,
            settings.cache_max_bytes_per_agent,
            settings.cache_ttl,
            settings.cache_max_agents,
            stats.clone(),
        ));
        let pool = UpstreamPool::new(specs, &settings, stats.clone());
        Self {
            pool,
            cache,
            settings: Arc::new(settings),
            stats,
        }
    }

    pub fn pool(&self) -> &UpstreamPool {
        &self.pool
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// All tools visible to the client: qualified upstream catalogs plus the
    /// three proxy tools.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let mut tools = self.pool.list_tools().await;
        tools.extend(proxy_tool_descriptors());
        tools
    }

    /// Forward to an upstream without interception. Used by the proxy tools'
    /// fresh mode, which caches the full response itself.
    pub async fn call_upstream_raw(
        &self,
        qualified: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, ProxyError> {
        self.pool.call_tool(qualified, arguments).await
    }

    /// Route one client `tools/call`.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, ProxyError> {
        if name.starts_with(PROXY_TOOL_PREFIX) {
            return run_proxy_tool(self, agent_id, name, arguments).await;
        }

        let result = self.pool.call_tool(name, arguments.clone()).await?;
        Ok(intercept_response(
            result,
            &self.settings,
            &self.cache,
            &self.stats,
            agent_id,
            name,
            &arguments.unwrap_or(Value::Null),
        ))
    }
}

/// Serves the client-facing MCP protocol over one connection.
pub struct Frontend {
    dispatcher: Dispatcher,
    agent_id: String,
}

impl Frontend {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            agent_id: DEFAULT_AGENT_ID.to_string(),
        }
    }

    /// Override the agent identity for this connection. The mapping from
    /// transport identity to agent id must be deterministic per connection.
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run the serve loop until the client disconnects.
    ///
    /// Each `tools/call` runs in its own task; responses are written as they
    /// complete.
    pub async fn serve<R, W>(&self, read: R, write: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut endpoint = lens_jsonrpc::Endpoint::connect_io(read, write).await?;
        let mut requests = endpoint
            .take_requests()
            .ok_or_else(|| anyhow::anyhow!("frontend requests receiver already taken"))?;
        let mut notifications = endpoint
            .take_notifications()
            .ok_or_else(|| anyhow::anyhow!("frontend notifications receiver already taken"))?;

        // Abort handles for in-flight calls, keyed by request id so that
        // notifications/cancelled can cancel the matching downstream call.
        let cancels: Arc<std::sync::Mutex<HashMap<lens_jsonrpc::Id, tokio::task::AbortHandle>>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));

        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => {
                        let dispatcher = self.dispatcher.clone();
                        let agent_id = self.agent_id.clone();
                        let request_id = req.id.clone();
                        let task_cancels = cancels.clone();
                        let cleanup_id = request_id.clone();
                        let abort = in_flight.spawn(async move {
                            handle_request(dispatcher, agent_id, req).await;
                            lock_cancels(&task_cancels).remove(&cleanup_id);
                        });
                        let mut map = lock_cancels(&cancels);
                        map.retain(|_, handle| !handle.is_finished());
                        map.insert(request_id, abort);
                    }
                    None => break,
                },
                note = notifications.recv() => match note {
                    Some(note) => {
                        if note.method == "notifications/cancelled" {
                            cancel_request(&cancels, note.params.as_ref());
                        } else {
                            tracing::debug!(method = %note.method, "client notification");
                        }
                    }
                    None => break,
                },
                Some(outcome) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = outcome {
                        if err.is_panic() {
                            tracing::error!("tool-call task panicked");
                        }
                    }
                }
            }
        }

        tracing::info!("client disconnected");
        while let Some(outcome) = in_flight.join_next().await {
            if let Err(err) = outcome {
                if err.is_panic() {
                    tracing::error!("tool-call task panicked");
                }
            }
        }
        Ok(())
    }
}

fn lock_cancels(
    cancels: &Arc<std::sync::Mutex<HashMap<lens_jsonrpc::Id, tokio::task::AbortHandle>>>,
) -> std::sync::MutexGuard<'_, HashMap<lens_jsonrpc::Id, tokio::task::AbortHandle>> {
    cancels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Abort the in-flight call named by a `notifications/cancelled` params
/// object. The abandoned task drops its upstream request.
fn cancel_request(
    cancels: &Arc<std::sync::Mutex<HashMap<lens_jsonrpc::Id, tokio::task::AbortHandle>>>,
    params: Option<&Value>,
) {
    let id = params.and_then(|p| p.get("requestId")).and_then(|value| {
        if let Some(s) = value.as_str() {
            Some(lens_jsonrpc::Id::String(s.to_string()))
        } else {
            value.as_i64().map(lens_jsonrpc::Id::Integer)
        }
    });
    let Some(id) = id else {
        tracing::debug!("notifications/cancelled without a usable requestId");
        return;
    };

    if let Some(handle) = lock_cancels(cancels).remove(&id) {
        handle.abort();
        tracing::debug!(request_id = ?id, "cancelled in-flight tool call");
    }
}

async fn handle_request(
    dispatcher: Dispatcher,
    agent_id: String,
    req: lens_jsonrpc::IncomingRequest,
) {
    let outcome = match req.method.as_str() {
        "initialize" => {
            req.respond_ok(json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": PROXY_SERVER_NAME,
                    "version": PROXY_SERVER_VERSION,
                },
            }))
            .await
        }
        "ping" => req.respond_ok(json!({})).await,
        "tools/list" => {
            let tools = dispatcher.list_tools().await;
            req.respond_ok(json!({ "tools": tools })).await
        }
        "tools/call" => {
            let name = req
                .params
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(|v| v.as_str());
            let Some(name) = name else {
                let _ = req
                    .respond_error(JSONRPC_INVALID_PARAMS, "tools/call requires a name", None)
                    .await;
                return;
            };
            let name = name.to_string();
            let arguments = req.params.as_ref().and_then(|p| p.get("arguments")).cloned();

            let result = match dispatcher.dispatch(&agent_id, &name, arguments).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::debug!(tool = %name, error = %err, "tool call failed");
                    CallToolResult::error(err)
                }
            };
            match serde_json::to_value(&result) {
                Ok(value) => req.respond_ok(value).await,
                Err(err) => {
                    req.respond_error(
                        JSONRPC_INVALID_PARAMS,
                        format!("serialize tool result: {err}"),
                        None,
                    )
                    .await
                }
            }
        }
        other => {
            req.respond_error(
                JSONRPC_METHOD_NOT_FOUND,
                format!("method not found: {other}"),
                None,
            )
            .await
        }
    };

    if let Err(err) = outcome {
        tracing::debug!(method = %req.method, error = %err, "failed to write response");
    }
}
