use serde_json::{Map, Value};
use std::time::Duration;

/// Default tool call timeout (seconds) when no env override is provided.
pub const DEFAULT_TOOL_CALL_TIMEOUT_SECS: u64 = 60;

/// Maximum allowed timeout for `tools/call` (seconds).
///
/// Env: `MCP_BRIDGE_TOOL_CALL_TIMEOUT_MAX_SECS`.
#[must_use]
pub fn tool_call_timeout_max_secs() -> u64 {
    mcp_bridge_env::positive_u64("MCP_BRIDGE_TOOL_CALL_TIMEOUT_MAX_SECS")
        .unwrap_or(DEFAULT_TOOL_CALL_TIMEOUT_SECS)
}

/// Default timeout for `tools/call` when neither config nor the request sets one (seconds).
///
/// Env: `MCP_BRIDGE_TOOL_CALL_TIMEOUT_DEFAULT_SECS`. Always clamped to
/// [`tool_call_timeout_max_secs`].
#[must_use]
pub fn tool_call_timeout_default_secs() -> u64 {
    let max = tool_call_timeout_max_secs();
    mcp_bridge_env::positive_u64("MCP_BRIDGE_TOOL_CALL_TIMEOUT_DEFAULT_SECS")
        .unwrap_or(DEFAULT_TOOL_CALL_TIMEOUT_SECS)
        .min(max)
        .max(1)
}

/// Per-request timeout from a streaming `tools/call` `_meta.timeoutMs`, clamped to `max`.
///
/// Missing, zero, or non-numeric values fall back to `default`.
#[must_use]
pub fn timeout_from_meta(meta: Option<&Map<String, Value>>, default: Duration, max: Duration) -> Duration {
    meta.and_then(|m| m.get("timeoutMs"))
        .and_then(Value::as_u64)
        .filter(|ms| *ms > 0)
        .map_or(default, Duration::from_millis)
        .min(max)
}
