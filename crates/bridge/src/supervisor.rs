//! Backend supervision and lifecycle management.
//!
//! Each enabled server definition gets one child process speaking MCP over stdio. The supervisor
//! spawns it, performs the handshake, watches for exit and reports lifecycle events to the
//! registry refresh loop. It never restarts a process on its own.

use crate::backend::{Backend, BackendState, BackendStatus, StopReason};
use crate::config::ServerDefinition;
use crate::error::{BridgeError, Result};
use crate::registry::ToolRegistry;
use crate::rpc::{InboundNotification, RpcChannel};
use crate::secrets;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rmcp::model::{
    CallToolRequestParam, ClientCapabilities, Implementation, InitializeRequestParam,
    InitializeResult, ListToolsResult, PaginatedRequestParam, ProtocolVersion, Tool,
};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CLIENT_NAME: &str = "mcp-bridge";
const MAX_TOOL_PAGES: usize = 100;
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle events consumed by the registry refresh loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// The backend sent `notifications/tools/list_changed`.
    ToolsChanged { server: String, generation: u64 },
    /// The process for `generation` exited (crash, kill, or clean exit).
    Exited { server: String, generation: u64 },
}

// ============================================================================
// Stdio Backend
// ============================================================================

#[derive(Debug, Clone)]
struct StdioServerInfo {
    state: BackendState,
    enabled: bool,
    generation: u64,
    tool_count: usize,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct RunningProcess {
    generation: u64,
    channel: Arc<RpcChannel>,
    kill: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

/// Settings shared by all stdio backends.
#[derive(Clone)]
pub struct StdioBackendSettings {
    /// Bound on the handshake and on each `tools/list` page.
    pub startup_timeout: Duration,
    pub secret_timeout: Duration,
    pub events: Option<UnboundedSender<BackendEvent>>,
}

/// A stdio MCP server process.
pub struct StdioBackend {
    def: ServerDefinition,
    startup_timeout: Duration,
    secret_timeout: Duration,
    events: Option<UnboundedSender<BackendEvent>>,
    info: Arc<RwLock<StdioServerInfo>>,
    running: Arc<Mutex<Option<RunningProcess>>>,
    /// Serializes spawn against stop.
    lifecycle: tokio::sync::Mutex<()>,
}

impl StdioBackend {
    pub fn new(def: ServerDefinition, settings: StdioBackendSettings) -> Self {
        let enabled = def.enabled;
        Self {
            def,
            startup_timeout: settings.startup_timeout,
            secret_timeout: settings.secret_timeout,
            events: settings.events,
            info: Arc::new(RwLock::new(StdioServerInfo {
                state: BackendState::Stopped,
                enabled,
                generation: 0,
                tool_count: 0,
                pid: None,
                started_at: None,
                last_error: None,
            })),
            running: Arc::new(Mutex::new(None)),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    fn channel(&self) -> Result<Arc<RpcChannel>> {
        self.running
            .lock()
            .as_ref()
            .map(|r| Arc::clone(&r.channel))
            .ok_or_else(|| BridgeError::unavailable(&self.def.id, "backend is not running"))
    }

    fn channel_for(&self, generation: u64) -> Result<Arc<RpcChannel>> {
        self.running
            .lock()
            .as_ref()
            .filter(|r| r.generation == generation)
            .map(|r| Arc::clone(&r.channel))
            .ok_or_else(|| BridgeError::unavailable(&self.def.id, "stopped during startup"))
    }

    /// Spawn the child process and wire its pipes. Leaves the backend `starting`.
    async fn spawn_process(&self, generation: u64) -> Result<()> {
        let id = self.def.id.as_str();

        let secrets =
            secrets::resolve_secrets(id, &self.def.secret_commands, self.secret_timeout).await?;

        let mut cmd = Command::new(&self.def.command);
        cmd.args(&self.def.args)
            .envs(&self.def.env)
            .envs(secrets)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| BridgeError::Spawn {
            server: id.to_string(),
            reason: format!("'{}': {e}", self.def.command),
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(BridgeError::Spawn {
                server: id.to_string(),
                reason: "stdio pipes unavailable".to_string(),
            });
        };
        let pid = child.id();

        let (note_tx, note_rx) = tokio::sync::mpsc::unbounded_channel();
        let channel = RpcChannel::spawn(id, stdout, stdin, Some(note_tx));
        tokio::spawn(forward_notifications(
            id.to_string(),
            generation,
            note_rx,
            self.events.clone(),
        ));
        tokio::spawn(drain_stderr(id.to_string(), stderr));

        let kill = CancellationToken::new();
        let watcher = tokio::spawn(watch_exit(ExitWatch {
            server: id.to_string(),
            generation,
            child,
            kill: kill.clone(),
            channel: Arc::clone(&channel),
            info: Arc::clone(&self.info),
            running: Arc::clone(&self.running),
            events: self.events.clone(),
        }));

        *self.running.lock() = Some(RunningProcess {
            generation,
            channel,
            kill,
            watcher: Some(watcher),
        });
        {
            let mut info = self.info.write();
            info.pid = pid;
            info.started_at = Some(Utc::now());
        }

        tracing::debug!(server = id, pid, generation, "spawned backend process");
        Ok(())
    }

    async fn handshake(&self, generation: u64) -> Result<()> {
        let id = self.def.id.as_str();
        let channel = self.channel_for(generation)?;

        let params = InitializeRequestParam {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: CLIENT_NAME.to_string(),
                version: crate::VERSION.to_string(),
                ..Default::default()
            },
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| BridgeError::unavailable(id, format!("encode initialize: {e}")))?;
        let init = channel
            .request("initialize", Some(params), self.startup_timeout)
            .await
            .map_err(|e| match e {
                BridgeError::ShuttingDown => e,
                other => BridgeError::unavailable(id, format!("initialize failed: {other}")),
            })?;

        // Only logged; a backend with an unusual result shape is still usable.
        let (name, version) = match serde_json::from_value::<InitializeResult>(init) {
            Ok(init) => (init.server_info.name, init.server_info.version),
            Err(_) => ("?".to_string(), "?".to_string()),
        };
        tracing::info!(
            "MCP server '{}' connected: name={}, version={}",
            id,
            name,
            version
        );

        channel.notify("notifications/initialized", None)
    }

    fn fail_start(&self, generation: u64, err: &BridgeError) {
        let running = {
            let mut running = self.running.lock();
            if running.as_ref().is_some_and(|r| r.generation == generation) {
                running.take()
            } else {
                None
            }
        };
        if let Some(running) = running {
            running.channel.close(err.clone());
            running.kill.cancel();
        }

        let mut info = self.info.write();
        if info.generation == generation {
            info.state = BackendState::Stopped;
            info.pid = None;
            info.tool_count = 0;
            info.last_error = Some(err.to_string());
        }
        tracing::error!(server = %self.def.id, error = %err, "failed to start backend");
    }
}

#[async_trait]
impl Backend for StdioBackend {
    fn id(&self) -> &str {
        &self.def.id
    }

    fn state(&self) -> BackendState {
        self.info.read().state
    }

    fn status(&self) -> BackendStatus {
        let pending_calls = self
            .running
            .lock()
            .as_ref()
            .map_or(0, |r| r.channel.pending_count());
        let info = self.info.read();
        BackendStatus {
            id: self.def.id.clone(),
            state: info.state,
            enabled: info.enabled,
            tool_count: info.tool_count,
            pending_calls,
            pid: info.pid,
            started_at: info.started_at,
            last_error: info.last_error.clone(),
            generation: info.generation,
        }
    }

    fn enabled(&self) -> bool {
        self.info.read().enabled
    }

    fn set_enabled(&self, enabled: bool) {
        self.info.write().enabled = enabled;
    }

    fn generation(&self) -> u64 {
        self.info.read().generation
    }

    async fn start(&self) -> Result<()> {
        let generation = {
            let _lifecycle = self.lifecycle.lock().await;
            if self.running.lock().is_some() {
                return Ok(());
            }

            tracing::info!("Starting MCP server: {}", self.def.id);
            let generation = {
                let mut info = self.info.write();
                info.generation += 1;
                info.state = BackendState::Starting;
                info.tool_count = 0;
                info.last_error = None;
                info.generation
            };

            if let Err(e) = self.spawn_process(generation).await {
                self.fail_start(generation, &e);
                return Err(e);
            }
            generation
        };

        if let Err(e) = self.handshake(generation).await {
            self.fail_start(generation, &e);
            return Err(e);
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let id = self.def.id.as_str();
        let channel = self.channel()?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = match cursor.take() {
                Some(cursor) => Some(
                    serde_json::to_value(PaginatedRequestParam {
                        cursor: Some(cursor),
                    })
                    .map_err(|e| BridgeError::malformed(id, format!("encode cursor: {e}")))?,
                ),
                None => None,
            };
            let result = channel
                .request("tools/list", params, self.startup_timeout)
                .await?;
            let page: ListToolsResult = serde_json::from_value(result).map_err(|e| {
                BridgeError::malformed(id, format!("invalid tools/list result: {e}"))
            })?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
        Err(BridgeError::malformed(
            id,
            format!("tools/list returned more than {MAX_TOOL_PAGES} pages"),
        ))
    }

    async fn call_tool(&self, name: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        let id = self.def.id.as_str();
        let state = self.state();
        if state != BackendState::Ready {
            return Err(BridgeError::unavailable(id, format!("backend is {state}")));
        }
        let channel = self.channel()?;

        let arguments = match arguments {
            Value::Object(arguments) => Some(arguments),
            Value::Null => None,
            _ => {
                return Err(BridgeError::InvalidRequest(
                    "tool arguments must be a JSON object".to_string(),
                ));
            }
        };
        let params = serde_json::to_value(CallToolRequestParam {
            name: Cow::Owned(name.to_string()),
            arguments,
        })
        .map_err(|e| BridgeError::InvalidRequest(format!("encode tools/call: {e}")))?;
        let result = channel.request("tools/call", Some(params), timeout).await?;
        if !result.is_object() {
            return Err(BridgeError::malformed(
                id,
                "tools/call result is not an object",
            ));
        }
        Ok(result)
    }

    fn mark_ready(&self, generation: u64, tool_count: usize) -> bool {
        let mut info = self.info.write();
        if info.generation != generation || info.state == BackendState::Stopped {
            return false;
        }
        info.state = BackendState::Ready;
        info.tool_count = tool_count;
        info.last_error = None;
        true
    }

    fn mark_degraded(&self, generation: u64, reason: &str) -> bool {
        let mut info = self.info.write();
        if info.generation != generation || info.state == BackendState::Stopped {
            return false;
        }
        info.state = BackendState::Degraded;
        info.tool_count = 0;
        info.last_error = Some(reason.to_string());
        true
    }

    async fn stop(&self, reason: StopReason) {
        let _lifecycle = self.lifecycle.lock().await;

        let running = self.running.lock().take();
        {
            let mut info = self.info.write();
            info.state = BackendState::Stopped;
            info.tool_count = 0;
            info.pid = None;
        }
        let Some(mut running) = running else {
            return;
        };

        tracing::info!("Stopping MCP server: {}", self.def.id);
        let failed = running.channel.close(reason.error_for(&self.def.id));
        if failed > 0 {
            tracing::warn!(server = %self.def.id, failed, "failed pending calls on stop");
        }
        running.kill.cancel();

        if let Some(watcher) = running.watcher.take()
            && tokio::time::timeout(STOP_GRACE, watcher).await.is_err()
        {
            tracing::warn!(server = %self.def.id, "backend did not exit within grace period");
        }
    }
}

// ============================================================================
// Process tasks
// ============================================================================

struct ExitWatch {
    server: String,
    generation: u64,
    child: Child,
    kill: CancellationToken,
    channel: Arc<RpcChannel>,
    info: Arc<RwLock<StdioServerInfo>>,
    running: Arc<Mutex<Option<RunningProcess>>>,
    events: Option<UnboundedSender<BackendEvent>>,
}

/// Wait for the child to exit (or be killed) and propagate the exit exactly once.
async fn watch_exit(mut watch: ExitWatch) {
    let status = tokio::select! {
        status = watch.child.wait() => status,
        () = watch.kill.cancelled() => {
            if let Err(e) = watch.child.start_kill() {
                tracing::debug!(server = %watch.server, error = %e, "kill failed");
            }
            watch.child.wait().await
        }
    };
    let requested = watch.kill.is_cancelled();

    let reason = match &status {
        Ok(status) => format!("process exited ({status})"),
        Err(e) => format!("failed to wait for process: {e}"),
    };

    let failed = watch
        .channel
        .close(BridgeError::unavailable(&watch.server, reason.clone()));

    {
        let mut running = watch.running.lock();
        if running
            .as_ref()
            .is_some_and(|r| r.generation == watch.generation)
        {
            *running = None;
        }
    }
    {
        let mut info = watch.info.write();
        if info.generation == watch.generation {
            info.state = BackendState::Stopped;
            info.tool_count = 0;
            info.pid = None;
            if !requested {
                info.last_error = Some(reason.clone());
            }
        }
    }

    if requested {
        tracing::info!(server = %watch.server, %reason, "backend stopped");
    } else {
        tracing::warn!(server = %watch.server, %reason, failed, "backend exited unexpectedly");
    }

    if let Some(events) = &watch.events {
        let _ = events.send(BackendEvent::Exited {
            server: watch.server,
            generation: watch.generation,
        });
    }
}

async fn forward_notifications(
    server: String,
    generation: u64,
    mut notifications: UnboundedReceiver<InboundNotification>,
    events: Option<UnboundedSender<BackendEvent>>,
) {
    while let Some(note) = notifications.recv().await {
        match note.method.as_str() {
            "notifications/tools/list_changed" => {
                tracing::info!(server = %server, "tool list changed; scheduling refresh");
                if let Some(events) = &events {
                    let _ = events.send(BackendEvent::ToolsChanged {
                        server: server.clone(),
                        generation,
                    });
                }
            }
            "notifications/message" => {
                tracing::debug!(server = %server, params = ?note.params, "backend log message");
            }
            other => {
                tracing::debug!(server = %server, method = other, "ignoring backend notification");
            }
        }
    }
}

/// Forward a backend's stderr to the log so the pipe never fills up.
async fn drain_stderr<R>(server: String, stderr: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::debug!(server = %server, "stderr: {}", line);
                }
            }
        }
    }
}

// ============================================================================
// Backend Manager
// ============================================================================

/// Arena of all configured backends, keyed by server id.
pub struct BackendManager {
    backends: RwLock<BTreeMap<String, Arc<dyn Backend>>>,
}

impl BackendManager {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn add_backend(&self, backend: Arc<dyn Backend>) {
        let mut backends = self.backends.write();
        backends.insert(backend.id().to_string(), backend);
    }

    pub fn get_backend(&self, id: &str) -> Option<Arc<dyn Backend>> {
        self.backends.read().get(id).cloned()
    }

    pub fn get_all_backends(&self) -> Vec<Arc<dyn Backend>> {
        self.backends.read().values().cloned().collect()
    }

    pub fn get_all_status(&self) -> BTreeMap<String, BackendStatus> {
        self.backends
            .read()
            .iter()
            .map(|(id, backend)| (id.clone(), backend.status()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    /// Start every enabled backend concurrently. Failures are isolated per backend.
    ///
    /// Returns the number of backends that reached `ready`.
    pub async fn start_enabled(&self, registry: &ToolRegistry) -> usize {
        let enabled: Vec<_> = self
            .get_all_backends()
            .into_iter()
            .filter(|b| b.enabled())
            .collect();

        let results =
            futures::future::join_all(enabled.iter().map(|b| registry.activate(b))).await;
        results.iter().filter(|r| r.is_ok()).count()
    }

    /// Enable a backend at runtime and bring it to `ready`.
    pub async fn enable(&self, id: &str, registry: &ToolRegistry) -> Result<BackendStatus> {
        let backend = self
            .get_backend(id)
            .ok_or_else(|| BridgeError::ServerNotFound(id.to_string()))?;
        backend.set_enabled(true);
        if backend.state() == BackendState::Stopped {
            registry.activate(&backend).await?;
        }
        Ok(backend.status())
    }

    /// Disable a backend at runtime: stop its process and drop its tools.
    pub async fn disable(&self, id: &str, registry: &ToolRegistry) -> Result<BackendStatus> {
        let backend = self
            .get_backend(id)
            .ok_or_else(|| BridgeError::ServerNotFound(id.to_string()))?;
        backend.set_enabled(false);
        backend.stop(StopReason::Disabled).await;
        registry.remove_server(id);
        Ok(backend.status())
    }

    pub async fn shutdown_all(&self) {
        tracing::info!("Shutting down all backends");
        let backends = self.get_all_backends();
        futures::future::join_all(
            backends
                .iter()
                .map(|backend| backend.stop(StopReason::ShuttingDown)),
        )
        .await;
    }
}

impl Default for BackendManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::collections::HashMap;

    fn definition(id: &str, command: &str, args: &[&str]) -> ServerDefinition {
        ServerDefinition {
            id: id.to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| (*s).to_string()).collect(),
            env: HashMap::new(),
            secret_commands: BTreeMap::new(),
            enabled: true,
        }
    }

    fn settings(events: Option<UnboundedSender<BackendEvent>>) -> StdioBackendSettings {
        StdioBackendSettings {
            startup_timeout: Duration::from_secs(2),
            secret_timeout: Duration::from_secs(2),
            events,
        }
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let backend = StdioBackend::new(
            definition("ghost", "/definitely/not/a/binary", &[]),
            settings(None),
        );
        let err = backend.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnError);

        let status = backend.status();
        assert_eq!(status.state, BackendState::Stopped);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn failing_secret_blocks_the_spawn() {
        let mut def = definition("vault", "cat", &[]);
        def.secret_commands
            .insert("TOKEN".to_string(), vec!["false".to_string()]);
        let backend = StdioBackend::new(def, settings(None));

        let err = backend.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecretResolutionError);
        assert_eq!(backend.state(), BackendState::Stopped);
        assert_eq!(backend.status().pid, None);
    }

    #[tokio::test]
    async fn process_that_exits_during_handshake_is_stopped() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let backend = StdioBackend::new(
            definition("quitter", "sh", &["-c", "exit 3"]),
            settings(Some(tx)),
        );

        let err = backend.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(backend.state(), BackendState::Stopped);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            BackendEvent::Exited {
                server: "quitter".to_string(),
                generation: 1
            }
        );
    }

    #[tokio::test]
    async fn silent_process_times_out_and_is_killed() {
        let backend = StdioBackend::new(
            definition("mute", "sleep", &["30"]),
            StdioBackendSettings {
                startup_timeout: Duration::from_millis(200),
                secret_timeout: Duration::from_secs(1),
                events: None,
            },
        );
        let err = backend.start().await.unwrap_err();
        assert!(err.to_string().contains("initialize failed"), "{err}");
        assert_eq!(backend.state(), BackendState::Stopped);
        assert!(backend.call_tool("x", json!({}), Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn manager_reports_unknown_servers() {
        let manager = BackendManager::new();
        let registry = ToolRegistry::new();
        let err = manager.enable("nope", &registry).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerNotFound);
        assert!(manager.is_empty());
    }
}
