//! JSON-RPC 2.0 framing for the backend stdio pipes.
//!
//! Backends speak newline-delimited JSON-RPC. MCP payloads themselves are `rmcp::model` types;
//! this module only frames and classifies envelopes. Inbound parsing is lenient about shape: a
//! well-formed object that is not a valid message still reports its id, so a waiting call can be
//! failed rather than left hanging.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const JSONRPC_VERSION: &str = "2.0";

pub mod error_codes {
    pub const METHOD_NOT_FOUND: i64 = -32601;
}

// ============================================================================
// Envelopes
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Serialize a request as a single line (no trailing newline).
pub fn encode_request(id: u64, method: &str, params: Option<&Value>) -> String {
    let req = Request {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params,
    };
    // Serializing a struct of strings and JSON values cannot fail.
    serde_json::to_string(&req).unwrap_or_default()
}

pub fn encode_notification(method: &str, params: Option<&Value>) -> String {
    let note = Notification {
        jsonrpc: JSONRPC_VERSION,
        method,
        params,
    };
    serde_json::to_string(&note).unwrap_or_default()
}

#[must_use]
pub fn success_response(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

#[must_use]
pub fn error_response(id: &Value, error: &ErrorObject) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": error })
}

// ============================================================================
// Inbound classification (backend -> bridge)
// ============================================================================

/// One classified message read from a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A reply to one of our requests.
    Response {
        id: u64,
        outcome: std::result::Result<Value, ErrorObject>,
    },
    /// A reply carrying an id we could never have issued (non-numeric, negative, ...).
    ForeignResponse { id: Value },
    /// Backend-initiated notification.
    Notification { method: String, params: Option<Value> },
    /// Backend-initiated request that expects an answer.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// A JSON object whose shape is not a valid JSON-RPC message.
    ///
    /// `id` is populated when the object names a numeric id, so the caller waiting on it can be
    /// failed instead of left hanging.
    Invalid { id: Option<u64>, reason: String },
}

fn numeric_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    }
}

/// Classify one framed line.
///
/// Returns `Err` when the line is not a JSON object at all.
pub fn parse_inbound(line: &str) -> std::result::Result<Inbound, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;
    let Value::Object(mut obj) = value else {
        return Err("expected a JSON object".to_string());
    };

    let id = obj.remove("id").filter(|v| !v.is_null());
    let method = obj.remove("method");

    if let Some(method) = method {
        let Value::String(method) = method else {
            return Ok(Inbound::Invalid {
                id: id.as_ref().and_then(numeric_id),
                reason: "method must be a string".to_string(),
            });
        };
        let params = obj.remove("params");
        return Ok(match id {
            Some(id) => Inbound::Request { id, method, params },
            None => Inbound::Notification { method, params },
        });
    }

    let Some(id) = id else {
        return Ok(Inbound::Invalid {
            id: None,
            reason: "message has neither id nor method".to_string(),
        });
    };
    let Some(numeric) = numeric_id(&id) else {
        return Ok(Inbound::ForeignResponse { id });
    };

    if let Some(error) = obj.remove("error") {
        return Ok(match serde_json::from_value::<ErrorObject>(error) {
            Ok(error) => Inbound::Response {
                id: numeric,
                outcome: Err(error),
            },
            Err(e) => Inbound::Invalid {
                id: Some(numeric),
                reason: format!("invalid error object: {e}"),
            },
        });
    }

    match obj.remove("result") {
        Some(result) => Ok(Inbound::Response {
            id: numeric,
            outcome: Ok(result),
        }),
        None => Ok(Inbound::Invalid {
            id: Some(numeric),
            reason: "response has neither result nor error".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_results_and_errors() {
        let ok = parse_inbound(r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#).unwrap();
        assert_eq!(
            ok,
            Inbound::Response {
                id: 7,
                outcome: Ok(json!({"tools": []}))
            }
        );

        let err = parse_inbound(
            r#"{"jsonrpc":"2.0","id":"8","error":{"code":-32601,"message":"nope"}}"#,
        )
        .unwrap();
        let Inbound::Response { id, outcome } = err else {
            panic!("expected response");
        };
        assert_eq!(id, 8);
        assert_eq!(outcome.unwrap_err().code, -32601);
    }

    #[test]
    fn classifies_backend_initiated_messages() {
        let note = parse_inbound(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#)
            .unwrap();
        assert!(matches!(note, Inbound::Notification { ref method, .. } if method == "notifications/tools/list_changed"));

        let req = parse_inbound(r#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#).unwrap();
        assert!(matches!(req, Inbound::Request { ref method, .. } if method == "ping"));
    }

    #[test]
    fn shape_errors_keep_the_id_when_possible() {
        let bad = parse_inbound(r#"{"jsonrpc":"2.0","id":3}"#).unwrap();
        assert!(matches!(bad, Inbound::Invalid { id: Some(3), .. }));

        let foreign = parse_inbound(r#"{"jsonrpc":"2.0","id":"req-x","result":{}}"#).unwrap();
        assert!(matches!(foreign, Inbound::ForeignResponse { .. }));

        assert!(parse_inbound("not json").is_err());
        assert!(parse_inbound("[1,2]").is_err());
    }

    #[test]
    fn encodes_single_line_requests() {
        let params = json!({"name": "status"});
        let line = encode_request(4, "tools/call", Some(&params));
        assert!(!line.contains('\n'));
        let back: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(back["id"], 4);
        assert_eq!(back["method"], "tools/call");

        let note = encode_notification("notifications/initialized", None);
        assert_eq!(note, r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#);
    }
}
