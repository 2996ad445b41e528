//! Upstream session pool: spawns child MCP servers, owns their lifecycles,
//! and forwards tool calls.
//!
//! Health state machine per session:
//! `Starting -> Ready` on successful handshake, `Starting -> Failed` on
//! timeout/protocol error, `Ready -> Failed` if the child exits unexpectedly,
//! `Ready -> Closing -> Closed` on shutdown. Failed is terminal; the slot is
//! kept as a tombstone so later calls get a structured error instead of
//! "unknown tool".

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{ProxySettings, UpstreamSpec};
use crate::error::ProxyError;
use crate::mcp::{CallToolResult, ListToolsResult, Tool, MCP_PROTOCOL_VERSION, PROXY_SERVER_NAME, PROXY_SERVER_VERSION};
use crate::stats::ProxyStats;
use crate::upstream_name::{QualifiedName, UpstreamName};


/// Public view of a session's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Starting,
    Ready,
    Failed,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub ready: usize,
    pub failed: usize,
    pub closed: usize,
}

enum SessionState {
    Starting,
    Ready(ReadySession),
    Failed { reason: String },
    Closing,
    Closed,
}

impl SessionState {
    fn health(&self) -> SessionHealth {
        match self {
            Self::Starting => SessionHealth::Starting,
            Self::Ready(_) => SessionHealth::Ready,
            Self::Failed { .. } => SessionHealth::Failed,
            Self::Closing => SessionHealth::Closing,
            Self::Closed => SessionHealth::Closed,
        }
    }
}

#[derive(Clone)]
struct ReadySession {
    handle: lens_jsonrpc::EndpointHandle,
    catalog: Arc<Vec<Tool>>,
}

struct SessionSlot {
    name: UpstreamName,
    spec: UpstreamSpec,
    state: RwLock<SessionState>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionSlot {
    fn set_monitor(&self, handle: tokio::task::JoinHandle<()>) {
        let mut guard = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(handle);
    }

    fn take_monitor(&self) -> Option<tokio::task::JoinHandle<()>> {
        let mut guard = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.take()
    }
}

/// Owns every upstream session. Cloning shares the pool.
#[derive(Clone)]
pub struct UpstreamPool {
    inner: Arc<PoolShared>,
}

struct PoolShared {
    slots: HashMap<UpstreamName, Arc<SessionSlot>>,
    request_timeout: Duration,
    shutdown_grace: Duration,
    stats: ProxyStats,
}

impl UpstreamPool {
    pub fn new(
        specs: &BTreeMap<UpstreamName, UpstreamSpec>,
        settings: &ProxySettings,
        stats: ProxyStats,
    ) -> Self {
        let slots = specs
            .iter()
            .map(|(name, spec)| {
                let slot = Arc::new(SessionSlot {
                    name: name.clone(),
                    spec: spec.clone(),
                    state: RwLock::new(SessionState::Starting),
                    shutdown: CancellationToken::new(),
                    monitor: Mutex::new(None),
                });
                (name.clone(), slot)
            })
            .collect();

        Self {
            inner: Arc::new(PoolShared {
                slots,
                request_timeout: settings.request_timeout,
                shutdown_grace: settings.shutdown_grace,
                stats,
            }),
        }
    }

    /// Spawn and handshake every configured upstream in parallel.
    ///
    /// Individual failures leave a Failed tombstone; the pool comes up
    /// degraded-ready. Returns the number of Ready sessions.
    pub async fn start_all(&self) -> usize {
        let mut tasks = JoinSet::new();
        for slot in self.inner.slots.values() {
            let pool = self.clone();
            let slot = slot.clone();
            tasks.spawn(async move {
                pool.start_session(slot).await;
            });
        }
        while tasks.join_next().await.is_some() {}
        self.stats().ready
    }

    async fn start_session(&self, slot: Arc<SessionSlot>) {
        let outcome = self.spawn_and_handshake(&slot).await;
        match outcome {
            Ok(()) => {
                tracing::info!(upstream = %slot.name, "upstream ready");
            }
            Err(err) => {
                let reason = format!("{err:#}");
                tracing::warn!(upstream = %slot.name, error = %reason, "upstream failed to start");
                let mut state = slot.state.write().await;
                *state = SessionState::Failed { reason };
            }
        }
    }

    async fn spawn_and_handshake(&self, slot: &Arc<SessionSlot>) -> anyhow::Result<()> {
        let spec = &slot.spec;
        let mut cmd = Command::new(spec.command());
        cmd.args(spec.args());
        for (key, value) in spec.env() {
            cmd.env(key, value);
        }
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let endpoint = lens_jsonrpc::Endpoint::spawn_command(cmd)
            .await
            .with_context(|| format!("spawn upstream (upstream={})", slot.name))?;

        self.install_endpoint(slot, endpoint, spec.startup_timeout())
            .await
    }

    /// Attach an already-connected transport as an upstream session.
    ///
    /// The upstream must appear in the pool's specs. Used for in-memory
    /// upstreams in tests.
    pub async fn attach_io<R, W>(&self, name: &str, read: R, write: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let slot = self
            .inner
            .slots
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown upstream: {name}"))?
            .clone();
        let endpoint = lens_jsonrpc::Endpoint::connect_io(read, write)
            .await
            .with_context(|| format!("connect upstream io (upstream={name})"))?;

        let startup_timeout = slot.spec.startup_timeout();
        let result = self.install_endpoint(&slot, endpoint, startup_timeout).await;
        if let Err(err) = &result {
            let mut state = slot.state.write().await;
            *state = SessionState::Failed {
                reason: format!("{err:#}"),
            };
        }
        result
    }

    async fn install_endpoint(
        &self,
        slot: &Arc<SessionSlot>,
        mut endpoint: lens_jsonrpc::Endpoint,
        startup_timeout: Duration,
    ) -> anyhow::Result<()> {
        let handle = endpoint.handle();
        let catalog = tokio::time::timeout(
            startup_timeout,
            handshake(&slot.name, &handle),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "handshake timed out after {startup_timeout:?} (upstream={})",
                slot.name
            )
        })??;

        tracing::debug!(
            upstream = %slot.name,
            tools = catalog.len(),
            "handshake complete"
        );

        {
            let mut state = slot.state.write().await;
            *state = SessionState::Ready(ReadySession {
                handle,
                catalog: Arc::new(catalog),
            });
        }

        let monitor = spawn_monitor(
            slot.clone(),
            endpoint.take_child(),
            endpoint,
            self.inner.shutdown_grace,
        );
        slot.set_monitor(monitor);
        Ok(())
    }

    pub fn upstream_names(&self) -> Vec<UpstreamName> {
        self.inner.slots.keys().cloned().collect()
    }

    pub async fn health(&self, name: &str) -> Option<SessionHealth> {
        let slot = self.inner.slots.get(name)?;
        Some(slot.state.read().await.health())
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.inner.slots.len(),
            ..Default::default()
        };
        for slot in self.inner.slots.values() {
            // try_read never blocks long: writers hold the lock briefly.
            let health = match slot.state.try_read() {
                Ok(state) => state.health(),
                Err(_) => continue,
            };
            match health {
                SessionHealth::Ready => stats.ready += 1,
                SessionHealth::Failed => stats.failed += 1,
                SessionHealth::Closed => stats.closed += 1,
                SessionHealth::Starting | SessionHealth::Closing => {}
            }
        }
        stats
    }

    /// Union of all Ready upstreams' cached catalogs, rewritten with
    /// qualified names. Each session's catalog is included fully or not at
    /// all.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let mut tools = Vec::new();
        let mut names: Vec<&UpstreamName> = self.inner.slots.keys().collect();
        names.sort();
        for name in names {
            let slot = &self.inner.slots[name];
            let state = slot.state.read().await;
            let SessionState::Ready(ready) = &*state else {
                continue;
            };
            for tool in ready.catalog.iter() {
                let mut qualified = tool.clone();
                qualified.name = name.qualify(&tool.name);
                tools.push(qualified);
            }
        }
        tools
    }

    /// Forward a tool call to the owning upstream.
    ///
    /// Arguments travel verbatim; nothing is stripped or injected.
    pub async fn call_tool(
        &self,
        qualified: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, ProxyError> {
        self.inner.stats.record_tool_call();
        let result = self.call_tool_inner(qualified, arguments).await;
        if result.is_err() {
            self.inner.stats.record_tool_call_failure();
        }
        result
    }

    async fn call_tool_inner(
        &self,
        qualified: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, ProxyError> {
        let names: Vec<&UpstreamName> = self.inner.slots.keys().collect();
        let Some(resolved) = QualifiedName::resolve(qualified, names.into_iter()) else {
            return Err(ProxyError::UnknownTool(qualified.to_string()));
        };
        let upstream = resolved.upstream.clone();
        let native = resolved.native.to_string();

        let slot = self
            .inner
            .slots
            .get(upstream.as_str())
            .ok_or_else(|| ProxyError::UnknownTool(qualified.to_string()))?;

        let session = {
            let state = slot.state.read().await;
            match &*state {
                SessionState::Ready(ready) => ready.clone(),
                SessionState::Starting => {
                    return Err(ProxyError::UpstreamUnavailable {
                        upstream: upstream.to_string(),
                        reason: "session is still starting".to_string(),
                    });
                }
                SessionState::Failed { reason } => {
                    return Err(ProxyError::UpstreamUnavailable {
                        upstream: upstream.to_string(),
                        reason: reason.clone(),
                    });
                }
                SessionState::Closing | SessionState::Closed => {
                    return Err(ProxyError::UpstreamUnavailable {
                        upstream: upstream.to_string(),
                        reason: "session is shut down".to_string(),
                    });
                }
            }
        };

        let mut params = serde_json::json!({ "name": native });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }

        let timeout = self.inner.request_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            session.handle.request("tools/call", params),
        )
        .await;

        let result = match outcome {
            Err(_) => {
                return Err(ProxyError::UpstreamTimeout {
                    upstream: upstream.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Ok(Err(err)) if err.is_closed() => {
                return Err(ProxyError::UpstreamCrashed {
                    upstream: upstream.to_string(),
                });
            }
            Ok(Err(lens_jsonrpc::Error::Rpc {
                message, data, ..
            })) => {
                return Err(ProxyError::UpstreamError { message, data });
            }
            Ok(Err(err)) => {
                return Err(ProxyError::UpstreamError {
                    message: err.to_string(),
                    data: None,
                });
            }
            Ok(Ok(result)) => result,
        };

        serde_json::from_value(result).map_err(|err| ProxyError::UpstreamError {
            message: format!("invalid tools/call result from {upstream}: {err}"),
            data: None,
        })
    }

    /// Close every session in parallel with a bounded grace period.
    pub async fn shutdown(&self) {
        for slot in self.inner.slots.values() {
            slot.shutdown.cancel();
        }

        let grace = self.inner.shutdown_grace;
        let mut tasks = JoinSet::new();
        for slot in self.inner.slots.values() {
            let Some(monitor) = slot.take_monitor() else {
                continue;
            };
            tasks.spawn(async move {
                // The monitor performs close-wait-kill itself; bound the join
                // so a wedged child cannot hang shutdown.
                let budget = grace * 2 + Duration::from_secs(1);
                if tokio::time::timeout(budget, monitor).await.is_err() {
                    tracing::warn!("session monitor did not finish within shutdown budget");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        tracing::info!("upstream pool shut down");
    }
}

/// Initialize + initialized + tools/list over a fresh endpoint.
async fn handshake(
    name: &UpstreamName,
    handle: &lens_jsonrpc::EndpointHandle,
) -> anyhow::Result<Vec<Tool>> {
    let initialize_params = serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "clientInfo": {
            "name": PROXY_SERVER_NAME,
            "version": PROXY_SERVER_VERSION,
        },
        "capabilities": {},
    });

    let init_result = handle
        .request("initialize", initialize_params)
        .await
        .with_context(|| format!("initialize failed (upstream={name})"))?;

    if let Some(server_version) = init_result.get("protocolVersion").and_then(|v| v.as_str()) {
        if server_version != MCP_PROTOCOL_VERSION {
            tracing::warn!(
                upstream = %name,
                client = MCP_PROTOCOL_VERSION,
                server = server_version,
                "protocol version mismatch"
            );
        }
    }

    handle
        .notify("notifications/initialized", None)
        .await
        .with_context(|| format!("initialized notification failed (upstream={name})"))?;

    let tools_result = handle
        .request_optional("tools/list", None)
        .await
        .with_context(|| format!("tools/list failed (upstream={name})"))?;
    let catalog: ListToolsResult = serde_json::from_value(tools_result)
        .with_context(|| format!("invalid tools/list result (upstream={name})"))?;
    Ok(catalog.tools)
}

/// Background task owning the child's lifetime.
///
/// Exits when the child dies, the transport hits EOF, or shutdown is
/// requested. In-flight calls observe the endpoint close and fail.
fn spawn_monitor(
    slot: Arc<SessionSlot>,
    mut child: Option<Child>,
    mut endpoint: lens_jsonrpc::Endpoint,
    grace: Duration,
) -> tokio::task::JoinHandle<()> {
    let mut notifications = endpoint.take_notifications();
    let shutdown = slot.shutdown.clone();
    let handle = endpoint.handle();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                status = wait_child(&mut child), if child.is_some() => {
                    let reason = match status {
                        Ok(status) => format!("upstream exited unexpectedly: {status}"),
                        Err(err) => format!("upstream wait failed: {err}"),
                    };
                    tracing::warn!(upstream = %slot.name, %reason, "upstream crashed");
                    handle.close(reason.clone()).await;
                    let mut state = slot.state.write().await;
                    *state = SessionState::Failed { reason };
                    return;
                }
                note = recv_notification(&mut notifications) => {
                    match note {
                        Some(note) => {
                            tracing::debug!(
                                upstream = %slot.name,
                                method = %note.method,
                                "dropping upstream notification"
                            );
                        }
                        None => {
                            // Reader task ended: transport EOF without a
                            // child exit (or the child exit races us here).
                            let reason = "upstream closed its transport".to_string();
                            tracing::warn!(upstream = %slot.name, "upstream transport closed");
                            handle.close(reason.clone()).await;
                            let mut state = slot.state.write().await;
                            *state = SessionState::Failed { reason };
                            return;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    {
                        let mut state = slot.state.write().await;
                        *state = SessionState::Closing;
                    }
                    handle.close("proxy shutdown").await;
                    close_child(&slot.name, &mut child, grace).await;
                    drop(endpoint);
                    let mut state = slot.state.write().await;
                    *state = SessionState::Closed;
                    tracing::debug!(upstream = %slot.name, "session closed");
                    return;
                }
            }
        }
    })
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<std::process::ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn recv_notification(
    notifications: &mut Option<tokio::sync::mpsc::Receiver<lens_jsonrpc::Notification>>,
) -> Option<lens_jsonrpc::Notification> {
    match notifications {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Closing the endpoint already closed the child's stdin; give it the grace
/// period to exit before killing.
async fn close_child(name: &UpstreamName, child: &mut Option<Child>, grace: Duration) {
    let Some(child) = child else {
        return;
    };

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(upstream = %name, %status, "upstream exited");
        }
        Ok(Err(err)) => {
            tracing::warn!(upstream = %name, error = %err, "upstream wait failed");
        }
        Err(_) => {
            tracing::warn!(upstream = %name, ?grace, "upstream did not exit in time; killing");
            if child.start_kill().is_ok() {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        tracing::error!(upstream = %name, "upstream survived kill within grace");
                    }
                }
            }
        }
    }
}
