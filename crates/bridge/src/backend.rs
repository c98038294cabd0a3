//! Backend trait and lifecycle state.
//!
//! Every tool server the bridge aggregates is reached through [`Backend`]. The only production
//! implementation is the stdio process in `supervisor.rs`; the trait is the seam the registry and
//! router are written against.

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rmcp::model::Tool;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a backend.
///
/// `starting -> ready | degraded | stopped`, `ready <-> degraded`, any state `-> stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// Spawned; handshake or first tool listing in progress.
    Starting,
    /// Tools are listed and routable.
    Ready,
    /// Process alive but the last tool listing failed; not routable.
    Degraded,
    /// Not running (never started, failed, exited, or disabled).
    Stopped,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Starting => write!(f, "starting"),
            BackendState::Ready => write!(f, "ready"),
            BackendState::Degraded => write!(f, "degraded"),
            BackendState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why a backend is being stopped; decides what pending callers see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Disabled,
    ShuttingDown,
}

impl StopReason {
    pub(crate) fn error_for(self, server: &str) -> BridgeError {
        match self {
            StopReason::Disabled => BridgeError::unavailable(server, "backend disabled"),
            StopReason::ShuttingDown => BridgeError::ShuttingDown,
        }
    }
}

/// Status information for a backend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub id: String,
    pub state: BackendState,
    pub enabled: bool,
    pub tool_count: usize,
    pub pending_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Number of times a process has been spawned for this backend.
    pub generation: u64,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> BackendState;

    fn status(&self) -> BackendStatus;

    /// Whether the backend should be running (auto-enable policy or a runtime toggle).
    fn enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Identifies the current process; bumps on every start.
    fn generation(&self) -> u64;

    /// Spawn the process and complete the protocol handshake.
    ///
    /// On success the backend is `starting`; it becomes `ready` once its tools are listed.
    async fn start(&self) -> Result<()>;

    /// Fetch the backend's full tool list (following pagination).
    async fn list_tools(&self) -> Result<Vec<Tool>>;

    /// Invoke a tool by its local name and return the raw `tools/call` result.
    async fn call_tool(&self, name: &str, arguments: Value, timeout: Duration) -> Result<Value>;

    /// Record a successful listing for `generation`. Ignored if the process has since changed.
    fn mark_ready(&self, generation: u64, tool_count: usize) -> bool;

    /// Record a failed listing for `generation`. Ignored if the process has since changed.
    fn mark_degraded(&self, generation: u64, reason: &str) -> bool;

    /// Terminate the process and fail its pending calls.
    async fn stop(&self, reason: StopReason);
}
