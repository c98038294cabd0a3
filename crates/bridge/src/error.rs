//! Error types shared by every bridge component.
//!
//! A single enum covers backend lifecycle, correlation, catalog and session failures. The REST and
//! streaming surfaces translate it into HTTP statuses and JSON-RPC error objects respectively.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The backend executable could not be located or exec failed.
    #[error("failed to spawn backend '{server}': {reason}")]
    Spawn { server: String, reason: String },

    /// A secret-producing command failed while preparing a backend's environment.
    #[error("failed to resolve secret '{var}' for backend '{server}': {reason}")]
    SecretResolution {
        server: String,
        var: String,
        reason: String,
    },

    #[error("backend '{server}' is unavailable: {reason}")]
    BackendUnavailable { server: String, reason: String },

    #[error("call to backend '{server}' timed out after {}ms", .timeout.as_millis())]
    CallTimeout { server: String, timeout: Duration },

    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("session not initialized; call initialize first")]
    SessionNotInitialized,

    #[error("session expired")]
    SessionExpired,

    /// A backend answered a pending request with something that is not a valid response.
    #[error("malformed message from backend '{server}': {reason}")]
    MalformedUpstreamMessage { server: String, reason: String },

    /// A backend answered with a JSON-RPC error object.
    #[error("backend '{server}' returned error {code}: {message}")]
    Upstream {
        server: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("bridge is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Wire tag for an error, as reported in REST bodies and JSON-RPC `error.data.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    SpawnError,
    SecretResolutionError,
    BackendUnavailable,
    CallTimeout,
    ToolNotFound,
    ServerNotFound,
    SessionNotInitialized,
    SessionExpired,
    MalformedUpstreamMessage,
    UpstreamError,
    InvalidRequest,
    ShuttingDown,
    ConfigError,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SpawnError => "SpawnError",
            ErrorKind::SecretResolutionError => "SecretResolutionError",
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::CallTimeout => "CallTimeout",
            ErrorKind::ToolNotFound => "ToolNotFound",
            ErrorKind::ServerNotFound => "ServerNotFound",
            ErrorKind::SessionNotInitialized => "SessionNotInitialized",
            ErrorKind::SessionExpired => "SessionExpired",
            ErrorKind::MalformedUpstreamMessage => "MalformedUpstreamMessage",
            ErrorKind::UpstreamError => "UpstreamError",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::ShuttingDown => "ShuttingDown",
            ErrorKind::ConfigError => "ConfigError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BridgeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Spawn { .. } => ErrorKind::SpawnError,
            BridgeError::SecretResolution { .. } => ErrorKind::SecretResolutionError,
            BridgeError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            BridgeError::CallTimeout { .. } => ErrorKind::CallTimeout,
            BridgeError::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            BridgeError::ServerNotFound(_) => ErrorKind::ServerNotFound,
            BridgeError::SessionNotInitialized => ErrorKind::SessionNotInitialized,
            BridgeError::SessionExpired => ErrorKind::SessionExpired,
            BridgeError::MalformedUpstreamMessage { .. } => ErrorKind::MalformedUpstreamMessage,
            BridgeError::Upstream { .. } => ErrorKind::UpstreamError,
            BridgeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BridgeError::ShuttingDown => ErrorKind::ShuttingDown,
            BridgeError::Config(_) => ErrorKind::ConfigError,
        }
    }

    pub(crate) fn unavailable(server: &str, reason: impl Into<String>) -> Self {
        BridgeError::BackendUnavailable {
            server: server.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(server: &str, reason: impl Into<String>) -> Self {
        BridgeError::MalformedUpstreamMessage {
            server: server.to_string(),
            reason: reason.into(),
        }
    }
}
