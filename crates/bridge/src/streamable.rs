//! Streamable HTTP MCP surface (`/mcp`).
//!
//! Each `POST` carries one JSON-RPC message and receives a plain JSON reply; no server-initiated
//! stream is offered. Sessions are tracked by the `Mcp-Session-Id` header.

use crate::error::{BridgeError, ErrorKind};
use crate::http::AppState;
use crate::jsonrpc::JSONRPC_VERSION;
use crate::registry::split_namespaced;
use crate::router::CallTarget;
use crate::timeouts::timeout_from_meta;
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use rmcp::model::{
    CallToolRequestParam, ClientJsonRpcMessage, ClientRequest, EmptyResult, ErrorCode, ErrorData,
    GetMeta as _, Implementation, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, JsonRpcVersion2_0, ListToolsResult, RequestId, ServerCapabilities,
    ServerJsonRpcMessage, ServerResult, Tool,
};
use rmcp::transport::common::http_header::HEADER_SESSION_ID;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument as _;

const SERVER_NAME: &str = "mcp-bridge";

// Bridge-specific server errors (-32000..=-32099).
const SESSION_ERROR: ErrorCode = ErrorCode(-32000);
const BACKEND_UNAVAILABLE: ErrorCode = ErrorCode(-32001);
const CALL_TIMEOUT: ErrorCode = ErrorCode(-32002);
const MALFORMED_UPSTREAM: ErrorCode = ErrorCode(-32003);
const SHUTTING_DOWN: ErrorCode = ErrorCode(-32004);
const BACKEND_START_FAILED: ErrorCode = ErrorCode(-32005);

/// Methods the bridge answers; anything else is `-32601`.
const SUPPORTED_METHODS: &[&str] = &["initialize", "ping", "tools/list", "tools/call"];

/// JSON-RPC error for a bridge error.
#[must_use]
pub fn rpc_error(err: &BridgeError) -> ErrorData {
    let kind = err.kind();
    let code = match err {
        BridgeError::Upstream { code, .. } => {
            i32::try_from(*code).map_or(ErrorCode::INTERNAL_ERROR, ErrorCode)
        }
        _ => match kind {
            ErrorKind::ToolNotFound | ErrorKind::InvalidRequest | ErrorKind::ServerNotFound => {
                ErrorCode::INVALID_PARAMS
            }
            ErrorKind::SessionNotInitialized | ErrorKind::SessionExpired => SESSION_ERROR,
            ErrorKind::BackendUnavailable => BACKEND_UNAVAILABLE,
            ErrorKind::CallTimeout => CALL_TIMEOUT,
            ErrorKind::MalformedUpstreamMessage => MALFORMED_UPSTREAM,
            ErrorKind::ShuttingDown => SHUTTING_DOWN,
            ErrorKind::SpawnError | ErrorKind::SecretResolutionError => BACKEND_START_FAILED,
            ErrorKind::UpstreamError | ErrorKind::ConfigError => ErrorCode::INTERNAL_ERROR,
        },
    };

    let mut data = json!({ "kind": kind.as_str() });
    if let BridgeError::Upstream {
        data: Some(upstream),
        ..
    } = err
    {
        data["upstream"] = upstream.clone();
    }

    ErrorData::new(code, err.to_string(), Some(data))
}

fn session_status(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::SessionExpired => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn error_message(id: RequestId, error: ErrorData) -> ServerJsonRpcMessage {
    ServerJsonRpcMessage::Error(JsonRpcError {
        jsonrpc: JsonRpcVersion2_0,
        id,
        error,
    })
}

fn result_message(id: RequestId, result: ServerResult) -> ServerJsonRpcMessage {
    ServerJsonRpcMessage::Response(JsonRpcResponse {
        jsonrpc: JsonRpcVersion2_0,
        id,
        result,
    })
}

/// An error that cannot be tied to a request id.
fn envelope_error(error: &ErrorData) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": Value::Null, "error": error })
}

/// JSON reply, tagged with the session id when there is one.
fn reply<T: Serialize>(status: StatusCode, session: Option<&str>, body: &T) -> Response {
    let mut response = (status, Json(body)).into_response();
    if let Some(id) = session
        && let Ok(value) = HeaderValue::from_str(id)
    {
        response.headers_mut().insert(HEADER_SESSION_ID, value);
    }
    response
}

fn accepted(session: Option<&str>) -> Response {
    let mut response = StatusCode::ACCEPTED.into_response();
    if let Some(id) = session
        && let Ok(value) = HeaderValue::from_str(id)
    {
        response.headers_mut().insert(HEADER_SESSION_ID, value);
    }
    response
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// ============================================================================
// Envelope classification
// ============================================================================

/// One inbound message from a streaming client.
#[derive(Debug)]
pub enum ClientMessage {
    /// A request. `request` is the typed MCP request, or why the typed model rejected it.
    Request {
        id: RequestId,
        method: String,
        request: std::result::Result<ClientRequest, String>,
    },
    Notification {
        method: String,
    },
    /// A reply to a server-initiated request; the bridge never sends any.
    Response,
}

fn invalid_request(message: &'static str) -> ErrorData {
    ErrorData::new(ErrorCode::INVALID_REQUEST, message, None)
}

/// Parse a POST body into a single client message.
pub fn classify(body: &[u8]) -> std::result::Result<ClientMessage, ErrorData> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        ErrorData::new(ErrorCode::PARSE_ERROR, format!("Parse error: {e}"), None)
    })?;

    let obj = match value {
        Value::Object(obj) => obj,
        Value::Array(_) => return Err(invalid_request("Batch requests are not supported")),
        _ => return Err(invalid_request("Request must be a JSON object")),
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(invalid_request("jsonrpc must be \"2.0\""));
    }

    let id = obj.get("id").filter(|v| !v.is_null()).cloned();
    let method = match obj.get("method") {
        Some(Value::String(method)) => method.clone(),
        Some(_) => return Err(invalid_request("method must be a string")),
        None if id.is_some() && (obj.contains_key("result") || obj.contains_key("error")) => {
            return Ok(ClientMessage::Response);
        }
        None => return Err(invalid_request("Invalid JSON-RPC message")),
    };

    let Some(id) = id else {
        return Ok(ClientMessage::Notification { method });
    };
    let id: RequestId = serde_json::from_value(id)
        .map_err(|_| invalid_request("id must be a string or number"))?;

    let request = match serde_json::from_value::<ClientJsonRpcMessage>(Value::Object(obj)) {
        Ok(ClientJsonRpcMessage::Request(JsonRpcRequest { request, .. })) => Ok(request),
        Ok(_) => Err("not a request".to_string()),
        Err(e) => Err(e.to_string()),
    };
    Ok(ClientMessage::Request {
        id,
        method,
        request,
    })
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /mcp
pub async fn handle_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session = session_header(&headers);
    let span = tracing::info_span!(
        "mcp",
        session = session.as_deref().unwrap_or("-"),
        method = tracing::field::Empty,
    );

    async move {
        let message = match classify(&body) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(code = error.code.0, "rejecting malformed message");
                return reply(
                    StatusCode::BAD_REQUEST,
                    session.as_deref(),
                    &envelope_error(&error),
                );
            }
        };

        match message {
            ClientMessage::Response => accepted(session.as_deref()),
            ClientMessage::Notification { method } => {
                tracing::Span::current().record("method", method.as_str());
                handle_notification(&state, session.as_deref(), &method)
            }
            ClientMessage::Request {
                id,
                method,
                request,
            } => {
                tracing::Span::current().record("method", method.as_str());
                handle_request(&state, session.as_deref(), id, &method, request).await
            }
        }
    }
    .instrument(span)
    .await
}

fn handle_notification(state: &AppState, session: Option<&str>, method: &str) -> Response {
    let Some(id) = session else {
        let error = rpc_error(&BridgeError::SessionNotInitialized);
        return reply(StatusCode::BAD_REQUEST, None, &envelope_error(&error));
    };
    if let Err(e) = state.sessions.touch(id) {
        return reply(session_status(&e), Some(id), &envelope_error(&rpc_error(&e)));
    }
    if method == "notifications/initialized" {
        state.sessions.mark_active(id);
    }
    tracing::debug!(method, "notification accepted");
    accepted(Some(id))
}

/// What a session-bound request produced.
enum Outcome {
    Result(ServerResult),
    /// A backend's `tools/call` result, forwarded untouched.
    ToolResult(Value),
    Error(ErrorData),
}

async fn handle_request(
    state: &AppState,
    session: Option<&str>,
    id: RequestId,
    method: &str,
    request: std::result::Result<ClientRequest, String>,
) -> Response {
    if method == "initialize" {
        return handle_initialize(state, session, id, request);
    }

    let Some(session_id) = session else {
        let err = BridgeError::SessionNotInitialized;
        return reply(
            session_status(&err),
            None,
            &error_message(id, rpc_error(&err)),
        );
    };
    if let Err(err) = state.sessions.touch(session_id) {
        return reply(
            session_status(&err),
            Some(session_id),
            &error_message(id, rpc_error(&err)),
        );
    }

    let outcome = match request {
        Ok(request) => dispatch(state, method, request).await,
        Err(reason) if SUPPORTED_METHODS.contains(&method) => Outcome::Error(ErrorData::new(
            ErrorCode::INVALID_PARAMS,
            format!("Invalid params: {reason}"),
            None,
        )),
        Err(_) => Outcome::Error(method_not_found(method)),
    };

    match outcome {
        Outcome::Result(result) => {
            state.sessions.mark_active(session_id);
            reply(StatusCode::OK, Some(session_id), &result_message(id, result))
        }
        Outcome::ToolResult(result) => {
            state.sessions.mark_active(session_id);
            let body = json!({ "jsonrpc": JsonRpcVersion2_0, "id": id, "result": result });
            reply(StatusCode::OK, Some(session_id), &body)
        }
        Outcome::Error(error) => reply(StatusCode::OK, Some(session_id), &error_message(id, error)),
    }
}

fn method_not_found(method: &str) -> ErrorData {
    ErrorData::new(
        ErrorCode::METHOD_NOT_FOUND,
        format!("Method not found: {method}"),
        None,
    )
}

async fn dispatch(state: &AppState, method: &str, request: ClientRequest) -> Outcome {
    let router = &state.router;
    let timeout = timeout_from_meta(
        Some(&request.get_meta().0),
        router.default_timeout(),
        router.max_timeout(),
    );
    match request {
        ClientRequest::PingRequest(_) => Outcome::Result(ServerResult::EmptyResult(EmptyResult {})),
        ClientRequest::ListToolsRequest(_) => {
            Outcome::Result(ServerResult::ListToolsResult(list_tools(state)))
        }
        ClientRequest::CallToolRequest(call) => {
            match call_tool(state, call.params, timeout).await {
                Ok(result) => Outcome::ToolResult(result),
                Err(error) => Outcome::Error(error),
            }
        }
        _ => Outcome::Error(method_not_found(method)),
    }
}

fn handle_initialize(
    state: &AppState,
    session: Option<&str>,
    id: RequestId,
    request: std::result::Result<ClientRequest, String>,
) -> Response {
    if let Some(existing) = session
        && state.sessions.touch(existing).is_ok()
    {
        let error = invalid_request("Session already initialized");
        return reply(
            StatusCode::BAD_REQUEST,
            Some(existing),
            &error_message(id, error),
        );
    }
    if state.router.is_shutting_down() {
        let error = rpc_error(&BridgeError::ShuttingDown);
        return reply(StatusCode::OK, None, &error_message(id, error));
    }

    let params = match request {
        Ok(ClientRequest::InitializeRequest(init)) => init.params,
        Ok(_) => {
            let error = ErrorData::new(ErrorCode::INVALID_PARAMS, "Invalid params", None);
            return reply(StatusCode::OK, None, &error_message(id, error));
        }
        Err(reason) => {
            let error = ErrorData::new(
                ErrorCode::INVALID_PARAMS,
                format!("Invalid params: {reason}"),
                None,
            );
            return reply(StatusCode::OK, None, &error_message(id, error));
        }
    };

    let client_version = serde_json::to_value(&params.protocol_version)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let client_info = serde_json::to_value(&params.client_info).ok();
    let session_id = state.sessions.create(client_info, &client_version);

    let mut capabilities = ServerCapabilities::builder().enable_tools().build();
    if let Some(tools) = capabilities.tools.as_mut() {
        tools.list_changed = Some(false);
    }
    let result = InitializeResult {
        protocol_version: params.protocol_version,
        capabilities,
        server_info: Implementation {
            name: SERVER_NAME.to_string(),
            version: state.version.to_string(),
            ..Default::default()
        },
        instructions: None,
    };
    reply(
        StatusCode::OK,
        Some(&session_id),
        &result_message(id, ServerResult::InitializeResult(result)),
    )
}

fn list_tools(state: &AppState) -> ListToolsResult {
    let snapshot = state.router.registry().snapshot();
    let tools: Vec<Tool> = snapshot
        .tools()
        .map(|tool| {
            let description = match tool.description.as_deref() {
                Some(d) if !d.is_empty() => format!("[{}] {}", tool.server_id, d),
                _ => format!("[{}]", tool.server_id),
            };
            let schema = match &tool.input_schema {
                Value::Object(schema) => schema.clone(),
                _ => Map::new(),
            };
            Tool::new(tool.namespaced_name.clone(), description, Arc::new(schema))
        })
        .collect();
    ListToolsResult::with_all_items(tools)
}

async fn call_tool(
    state: &AppState,
    params: CallToolRequestParam,
    timeout: Duration,
) -> std::result::Result<Value, ErrorData> {
    if split_namespaced(&params.name).is_none() {
        return Err(rpc_error(&BridgeError::InvalidRequest(format!(
            "tool name '{}' is not namespaced as <server>__<tool>",
            params.name
        ))));
    }

    let arguments = Value::Object(params.arguments.unwrap_or_default());
    state
        .router
        .call(CallTarget::Namespaced(&params.name), arguments, Some(timeout))
        .await
        .map_err(|e| rpc_error(&e))
}

/// GET /mcp - No server-initiated stream is offered.
pub async fn handle_get() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST, DELETE")],
    )
        .into_response()
}

/// DELETE /mcp - Close the session named by the header.
pub async fn handle_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> StatusCode {
    match session_header(&headers) {
        None => StatusCode::BAD_REQUEST,
        Some(id) if state.sessions.close(&id) => StatusCode::NO_CONTENT,
        Some(_) => StatusCode::NOT_FOUND,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn classifies_envelopes() {
        let msg = classify(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Request { ref method, request: Ok(ClientRequest::ListToolsRequest(_)), .. }
                if method == "tools/list"
        ));

        let msg = classify(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Notification { ref method } if method == "notifications/initialized"
        ));

        let msg = classify(br#"{"jsonrpc":"2.0","id":"s-1","result":{}}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Response));
    }

    #[test]
    fn tool_calls_parse_into_typed_requests() {
        let body = br#"{"jsonrpc":"2.0","id":7,"method":"tools/call",
            "params":{"name":"git__status","arguments":{"path":"."},"_meta":{"timeoutMs":250}}}"#;
        let ClientMessage::Request {
            request: Ok(request),
            ..
        } = classify(body).unwrap()
        else {
            panic!("expected a typed request");
        };

        let timeout = timeout_from_meta(
            Some(&request.get_meta().0),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        assert_eq!(timeout, Duration::from_millis(250));

        let ClientRequest::CallToolRequest(call) = request else {
            panic!("expected tools/call");
        };
        assert_eq!(call.params.name, "git__status");
        assert_eq!(call.params.arguments.unwrap()["path"], ".");
    }

    #[test]
    fn malformed_params_keep_the_request_id() {
        let msg = classify(br#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{}}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Request { ref method, request: Err(_), .. } if method == "tools/call"
        ));
    }

    #[test]
    fn rejects_bad_envelopes_with_protocol_codes() {
        assert_eq!(classify(b"{oops").unwrap_err().code, ErrorCode::PARSE_ERROR);
        assert_eq!(
            classify(br#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#)
                .unwrap_err()
                .code,
            ErrorCode::INVALID_REQUEST
        );
        assert_eq!(
            classify(br#"{"id":1,"method":"ping"}"#).unwrap_err().code,
            ErrorCode::INVALID_REQUEST
        );
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","id":1}"#).unwrap_err().code,
            ErrorCode::INVALID_REQUEST
        );
    }

    #[test]
    fn bridge_errors_map_to_codes() {
        let cases = [
            (
                BridgeError::ToolNotFound {
                    name: "a__b".to_string(),
                },
                ErrorCode::INVALID_PARAMS,
            ),
            (BridgeError::SessionExpired, SESSION_ERROR),
            (
                BridgeError::unavailable("git", "exited"),
                BACKEND_UNAVAILABLE,
            ),
            (
                BridgeError::CallTimeout {
                    server: "git".to_string(),
                    timeout: Duration::from_secs(1),
                },
                CALL_TIMEOUT,
            ),
            (BridgeError::ShuttingDown, SHUTTING_DOWN),
            (
                BridgeError::Upstream {
                    server: "git".to_string(),
                    code: -32099,
                    message: "boom".to_string(),
                    data: None,
                },
                ErrorCode(-32099),
            ),
        ];
        for (err, code) in cases {
            let error = rpc_error(&err);
            assert_eq!(error.code, code, "{err}");
            assert_eq!(error.data.unwrap()["kind"], err.kind().as_str());
        }
    }

    #[test]
    fn out_of_range_upstream_codes_become_internal_errors() {
        let err = BridgeError::Upstream {
            server: "git".to_string(),
            code: i64::from(i32::MAX) + 1,
            message: "boom".to_string(),
            data: Some(json!({"detail": 1})),
        };
        let error = rpc_error(&err);
        assert_eq!(error.code, ErrorCode::INTERNAL_ERROR);
        assert_eq!(error.data.unwrap()["upstream"]["detail"], 1);
    }
}
