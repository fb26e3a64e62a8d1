use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use webpilot_core::types::{ConnectionState, ContentBlock, ToolResult, ToolSpec};
use webpilot_core::{Error, GatewayConfig, Result};

use crate::ToolExecutor;

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<u64>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Terminal outcome of one in-flight request, delivered through the pending
/// map. Connection loss is kept distinct from a JSON-RPC error so the caller
/// can classify it as connection-class and trigger a reconnect.
#[derive(Debug)]
enum RpcCompletion {
    Result(Value),
    RpcError { code: i64, message: String },
    ConnectionClosed(String),
}

fn classify_completion(completion: RpcCompletion) -> Result<Value> {
    match completion {
        RpcCompletion::Result(value) => Ok(value),
        RpcCompletion::RpcError { code, message } => {
            Err(Error::ToolExecution(format!("JSON-RPC error {}: {}", code, message)))
        }
        RpcCompletion::ConnectionClosed(reason) => Err(Error::GatewayUnavailable(reason)),
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcCompletion>>>>;

/// One live connection to the automation process. Replaced wholesale on
/// reconnect.
struct Connection {
    stdin: Arc<Mutex<ChildStdin>>,
    pending: PendingMap,
    child: Child,
    reader_handle: JoinHandle<()>,
}

/// Exponential backoff for reconnect attempts. The first attempt runs
/// immediately; later attempts double the base delay, capped at 30s.
fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let ms = base_ms.saturating_mul(1u64 << (attempt - 1).min(16)).min(30_000);
    Duration::from_millis(ms)
}

/// The background probe only makes sense when the connection has a mixed
/// track record and the last success is stale relative to the last failure.
/// An idle-but-fine connection is never probed.
fn probe_needed(last_success: Option<Instant>, last_failure: Option<Instant>) -> bool {
    match (last_success, last_failure) {
        (Some(s), Some(f)) => s < f,
        _ => false,
    }
}

fn is_connection_error(err: &Error) -> bool {
    matches!(err.kind(), webpilot_core::ErrorKind::GatewayUnavailable)
}

/// Parse an MCP-style `tools/call` result (`{content: [...], isError}`) into
/// ordered content blocks.
fn parse_tool_result(result: &Value) -> ToolResult {
    let is_error = result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false);
    let mut content = Vec::new();
    if let Some(arr) = result.get("content").and_then(|c| c.as_array()) {
        for item in arr {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                        content.push(ContentBlock::Text(text.to_string()));
                    }
                }
                Some("image") => {
                    let media_type = item
                        .get("mimeType")
                        .and_then(|m| m.as_str())
                        .unwrap_or("image/png")
                        .to_string();
                    if let Some(data) = item.get("data").and_then(|d| d.as_str()) {
                        content.push(ContentBlock::Image {
                            media_type,
                            data_b64: data.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
    }
    ToolResult { content, is_error }
}

/// Gateway to the external browser automation process.
///
/// Owns the subprocess, the JSON-RPC channel over its stdio, the cached tool
/// catalog, and the connection state machine. No other component transitions
/// the state.
pub struct AutomationGateway {
    config: GatewayConfig,
    http: reqwest::Client,
    state: StdMutex<ConnectionState>,
    conn: Mutex<Option<Connection>>,
    next_id: AtomicU64,
    tools: StdRwLock<Vec<ToolSpec>>,
    /// Serializes reconnects; also taken by initialize() and the health
    /// probe so none of the three ever run concurrently.
    reconnect_gate: Mutex<()>,
    /// Bumped on every successful connect so callers queued behind an
    /// in-flight reconnect can tell it already satisfied them.
    generation: AtomicU64,
    connect_attempts: AtomicU32,
    last_success: StdMutex<Option<Instant>>,
    last_failure: StdMutex<Option<Instant>>,
}

impl AutomationGateway {
    pub fn new(config: GatewayConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build probe HTTP client, using default");
                reqwest::Client::new()
            });
        Self {
            config,
            http,
            state: StdMutex::new(ConnectionState::Disconnected),
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
            tools: StdRwLock::new(Vec::new()),
            reconnect_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
            connect_attempts: AtomicU32::new(0),
            last_success: StdMutex::new(None),
            last_failure: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn record_success(&self) {
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn record_failure(&self) {
        *self.last_failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Spawn or attach to the automation process, wait until it answers the
    /// liveness probe, open the channel, and retrieve the tool catalog.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.reconnect_gate.lock().await;
        self.set_state(ConnectionState::Connecting);
        self.teardown().await;
        match self.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(Error::GatewayStartup(e.to_string()))
            }
        }
    }

    /// Single-flight reconnect with bounded exponential backoff. Callers
    /// arriving while one is in flight wait for it instead of starting a
    /// second attempt; exhausting the attempt budget parks the gateway in
    /// `Failed` until the next explicit initialize().
    pub async fn reconnect(&self) -> Result<()> {
        let gen_before = self.generation.load(Ordering::SeqCst);
        let _guard = self.reconnect_gate.lock().await;

        if self.generation.load(Ordering::SeqCst) != gen_before {
            // A reconnect completed while we were queued; it decides for us.
            return match self.state() {
                ConnectionState::Ready => Ok(()),
                _ => Err(Error::GatewayUnavailable("reconnect did not recover the connection".into())),
            };
        }
        if self.state() == ConnectionState::Failed {
            return Err(Error::GatewayUnavailable(
                "reconnect attempts exhausted; initialize() required".into(),
            ));
        }

        self.set_state(ConnectionState::Degraded);
        let max_attempts = self.config.max_reconnect_attempts.max(1);
        for attempt in 0..max_attempts {
            let delay = backoff_delay(attempt, self.config.reconnect_base_delay_ms);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.teardown().await;
            match self.connect().await {
                Ok(()) => {
                    info!(attempt, "Gateway reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "Gateway reconnect attempt failed");
                }
            }
        }

        self.set_state(ConnectionState::Failed);
        error!(max_attempts, "Gateway reconnect attempts exhausted");
        Err(Error::GatewayUnavailable(
            "reconnect attempts exhausted; initialize() required".into(),
        ))
    }

    /// Release the channel and terminate the owned subprocess. Best effort:
    /// every sub-step tolerates failure independently.
    pub async fn shutdown(&self) {
        self.teardown().await;
        self.tools.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.set_state(ConnectionState::Disconnected);
        info!("Gateway shut down");
    }

    /// Start the background health probe. It fires only when the connection
    /// has both a prior success and a more recent failure, and it defers to
    /// any reconnect already in flight.
    pub fn spawn_health_probe(self: &Arc<Self>) -> CancellationToken {
        let token = CancellationToken::new();
        let gateway = self.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(gateway.config.health_interval_secs.max(1));
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let needed = probe_needed(
                    *gateway.last_success.lock().unwrap_or_else(|e| e.into_inner()),
                    *gateway.last_failure.lock().unwrap_or_else(|e| e.into_inner()),
                );
                if !needed || gateway.state() == ConnectionState::Failed {
                    continue;
                }

                // Probe under the gate so it never overlaps a reconnect.
                let alive = match gateway.reconnect_gate.try_lock() {
                    Ok(_guard) => gateway.probe_alive().await,
                    Err(_) => continue,
                };

                if alive {
                    gateway.record_success();
                } else {
                    warn!("Health probe found gateway unreachable, handing off to reconnect");
                    if let Err(e) = gateway.reconnect().await {
                        warn!(error = %e, "Health-triggered reconnect failed");
                    }
                }
            }
            debug!("Health probe stopped");
        });
        token
    }

    async fn probe_alive(&self) -> bool {
        match self.http.get(&self.config.probe_url).send().await {
            // Any 2xx/4xx means the process is up and answering.
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        }
    }

    /// One full connect: spawn, probe, handshake, catalog.
    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::GatewayUnavailable(format!(
                "failed to spawn '{}': {}",
                self.config.command, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::GatewayUnavailable("automation process has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::GatewayUnavailable("automation process has no stdout".into()))?;

        self.wait_until_alive().await?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_handle = tokio::spawn(Self::reader_task(stdout, pending.clone()));

        {
            let mut slot = self.conn.lock().await;
            *slot = Some(Connection {
                stdin: Arc::new(Mutex::new(stdin)),
                pending,
                child,
                reader_handle,
            });
        }

        self.handshake().await?;
        self.refresh_tools().await?;

        self.set_state(ConnectionState::Ready);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.record_success();
        info!(tools = self.tools.read().unwrap_or_else(|e| e.into_inner()).len(), "Gateway ready");
        Ok(())
    }

    /// Poll the liveness probe with a bounded attempt budget.
    async fn wait_until_alive(&self) -> Result<()> {
        let attempts = self.config.startup_attempts.max(1);
        for attempt in 0..attempts {
            if self.probe_alive().await {
                debug!(attempt, "Automation process answered liveness probe");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(self.config.startup_poll_ms)).await;
        }
        Err(Error::GatewayUnavailable(format!(
            "automation process never answered liveness probe at {} within {} attempts",
            self.config.probe_url, attempts
        )))
    }

    /// MCP-style initialize handshake plus the initialized notification.
    async fn handshake(&self) -> Result<()> {
        let params = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": "webpilot",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = self.rpc_request("initialize", Some(params)).await?;
        debug!(?result, "Gateway handshake complete");

        let notif = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        });
        self.send_raw(&notif.to_string()).await;
        Ok(())
    }

    async fn refresh_tools(&self) -> Result<()> {
        let result = self.rpc_request("tools/list", None).await?;
        let tools: Vec<ToolSpec> = serde_json::from_value(
            result.get("tools").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|e| Error::GatewayUnavailable(format!("failed to parse tool catalog: {}", e)))?;
        debug!(count = tools.len(), "Tool catalog loaded");
        *self.tools.write().unwrap_or_else(|e| e.into_inner()) = tools;
        Ok(())
    }

    /// Fire-and-forget write (notifications). Failures are logged, not raised.
    async fn send_raw(&self, line: &str) {
        let stdin = {
            let conn = self.conn.lock().await;
            conn.as_ref().map(|c| c.stdin.clone())
        };
        if let Some(stdin) = stdin {
            let mut stdin = stdin.lock().await;
            let _ = stdin.write_all(line.as_bytes()).await;
            let _ = stdin.write_all(b"\n").await;
            let _ = stdin.flush().await;
        }
    }

    /// Send a JSON-RPC request and wait for the response, bounded by the
    /// per-call timeout. Timeouts, resets, and closed channels surface as
    /// `GatewayUnavailable` (connection-class); JSON-RPC errors as
    /// `ToolExecution`.
    async fn rpc_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let (stdin, pending) = {
            let conn = self.conn.lock().await;
            match conn.as_ref() {
                Some(c) => (c.stdin.clone(), c.pending.clone()),
                None => return Err(Error::GatewayUnavailable("not connected".into())),
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        };
        let line = serde_json::to_string(&req)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut map = pending.lock().await;
            map.insert(id, tx);
        }

        debug!(id, method, "Gateway request");
        {
            let mut stdin = stdin.lock().await;
            let write = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                pending.lock().await.remove(&id);
                return Err(Error::GatewayUnavailable(format!("write error: {}", e)));
            }
        }

        let timeout = Duration::from_secs(self.config.call_timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(completion)) => classify_completion(completion),
            Ok(Err(_)) => Err(Error::GatewayUnavailable("connection closed mid-call".into())),
            Err(_) => {
                pending.lock().await.remove(&id);
                Err(Error::GatewayUnavailable(format!(
                    "call to '{}' timed out after {}s",
                    method, self.config.call_timeout_secs
                )))
            }
        }
    }

    /// One attempt at a tool call, no retry.
    async fn try_call(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });
        let result = self.rpc_request("tools/call", Some(params)).await?;
        Ok(parse_tool_result(&result))
    }

    async fn teardown(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(mut conn) = conn {
            conn.reader_handle.abort();
            if let Err(e) = conn.child.start_kill() {
                debug!(error = %e, "Kill of automation process failed (may have exited already)");
            }
            let mut map = conn.pending.lock().await;
            for (_, tx) in map.drain() {
                let _ = tx.send(RpcCompletion::ConnectionClosed("connection closed".to_string()));
            }
        }
    }

    /// Background reader: dispatches incoming JSON-RPC responses to waiting
    /// callers. Notifications (no id) are ignored.
    async fn reader_task(stdout: ChildStdout, pending: PendingMap) {
        let reader = BufReader::new(stdout);
        let mut lines = reader.lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    debug!(bytes = line.len(), "Gateway response line");
                    match serde_json::from_str::<JsonRpcResponse>(&line) {
                        Ok(resp) => {
                            if let Some(id) = resp.id {
                                let mut map = pending.lock().await;
                                if let Some(tx) = map.remove(&id) {
                                    let payload = if let Some(err) = resp.error {
                                        RpcCompletion::RpcError {
                                            code: err.code,
                                            message: err.message,
                                        }
                                    } else {
                                        RpcCompletion::Result(resp.result.unwrap_or(Value::Null))
                                    };
                                    let _ = tx.send(payload);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to parse gateway response line");
                        }
                    }
                }
                Ok(Some(_)) => {} // blank line
                Ok(None) => {
                    error!("Gateway stdout closed");
                    let mut map = pending.lock().await;
                    for (_, tx) in map.drain() {
                        let _ = tx.send(RpcCompletion::ConnectionClosed(
                            "automation process stdout closed".to_string(),
                        ));
                    }
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Gateway read error");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ToolExecutor for AutomationGateway {
    /// Forward a tool call. On a connection-class failure, trigger at most
    /// one transparent reconnect-and-retry; if the retry also fails, the
    /// original error propagates.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        match self.try_call(name, arguments.clone()).await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(original) if is_connection_error(&original) => {
                self.record_failure();
                warn!(tool = %name, error = %original, "Tool call hit connection failure, attempting reconnect");
                if self.reconnect().await.is_err() {
                    return Err(original);
                }
                match self.try_call(name, arguments).await {
                    Ok(result) => {
                        self.record_success();
                        Ok(result)
                    }
                    Err(retry_err) => {
                        self.record_failure();
                        debug!(error = %retry_err, "Retry after reconnect also failed");
                        Err(original)
                    }
                }
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn list_tools(&self) -> Vec<ToolSpec> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
