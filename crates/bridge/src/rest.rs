//! REST tool surface and management API.

use crate::backend::BackendStatus;
use crate::error::{BridgeError, ErrorKind};
use crate::http::AppState;
use crate::registry::RegisteredTool;
use crate::router::CallTarget;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;

/// HTTP status for an error kind.
#[must_use]
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ToolNotFound | ErrorKind::ServerNotFound | ErrorKind::SessionExpired => {
            StatusCode::NOT_FOUND
        }
        ErrorKind::InvalidRequest | ErrorKind::SessionNotInitialized => StatusCode::BAD_REQUEST,
        ErrorKind::BackendUnavailable
        | ErrorKind::ShuttingDown
        | ErrorKind::SpawnError
        | ErrorKind::SecretResolutionError => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::CallTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::MalformedUpstreamMessage | ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
        ErrorKind::ConfigError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A [`BridgeError`] rendered as `{"error": {"kind", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = json!({
            "error": {
                "kind": kind,
                "message": self.0.to_string(),
            }
        });
        (status_for(kind), Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Accept `{"arguments": {...}}` or the argument object itself. An empty body means `{}`.
pub fn parse_arguments(body: &[u8]) -> crate::error::Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| BridgeError::InvalidRequest(format!("body is not valid JSON: {e}")))?;
    let Value::Object(mut obj) = value else {
        return Err(BridgeError::InvalidRequest(
            "body must be a JSON object".to_string(),
        ));
    };

    match obj.remove("arguments") {
        None => Ok(Value::Object(obj)),
        Some(Value::Null) => Ok(json!({})),
        Some(args @ Value::Object(_)) => Ok(args),
        Some(_) => Err(BridgeError::InvalidRequest(
            "arguments must be a JSON object".to_string(),
        )),
    }
}

// ============================================================================
// Tool Endpoints
// ============================================================================

/// POST /tools/{server_id}/{tool_name} - Call a tool and return its raw result.
pub async fn call_tool(
    State(state): State<Arc<AppState>>,
    Path((server_id, tool_name)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let arguments = parse_arguments(&body)?;
    let result = state
        .router
        .call(
            CallTarget::Pair {
                server_id: &server_id,
                local_name: &tool_name,
            },
            arguments,
            None,
        )
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub duration_ms: f64,
}

/// POST /api/tools/{server_id}/{tool_name} - Call a tool; failures are reported in the body.
pub async fn call_tool_wrapped(
    State(state): State<Arc<AppState>>,
    Path((server_id, tool_name)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<ToolCallResponse>> {
    let target = CallTarget::Pair {
        server_id: &server_id,
        local_name: &tool_name,
    };
    state.router.resolve(target)?;
    let arguments = parse_arguments(&body)?;

    let started = Instant::now();
    let outcome = state.router.call(target, arguments, None).await;
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    Ok(Json(match outcome {
        Ok(result) => ToolCallResponse {
            success: true,
            result: Some(result),
            error: None,
            duration_ms,
        },
        Err(e) => ToolCallResponse {
            success: false,
            result: None,
            error: Some(json!({ "kind": e.kind(), "message": e.to_string() })),
            duration_ms,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct ToolQuery {
    #[serde(default)]
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSummary {
    pub server_id: String,
    pub name: String,
    pub namespaced_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&RegisteredTool> for ToolSummary {
    fn from(tool: &RegisteredTool) -> Self {
        Self {
            server_id: tool.server_id.clone(),
            name: tool.local_name.clone(),
            namespaced_name: tool.namespaced_name.clone(),
            description: tool.description.clone(),
        }
    }
}

/// GET /api/tools[?search=] - List routable tools.
pub async fn list_tools(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ToolQuery>,
) -> Json<Vec<ToolSummary>> {
    let snapshot = state.router.registry().snapshot();
    let tools = match query.search.as_deref().map(str::trim) {
        Some(q) if !q.is_empty() => snapshot
            .search(q)
            .iter()
            .map(|t| ToolSummary::from(t.as_ref()))
            .collect(),
        _ => snapshot
            .tools()
            .map(|t| ToolSummary::from(t.as_ref()))
            .collect(),
    };
    Json(tools)
}

/// GET /api/tools/{server_id}/{tool_name} - A tool's description and input schema.
pub async fn get_tool_schema(
    State(state): State<Arc<AppState>>,
    Path((server_id, tool_name)): Path<(String, String)>,
) -> ApiResult<Json<RegisteredTool>> {
    let tool = state
        .router
        .registry()
        .resolve_pair(&server_id, &tool_name)?;
    Ok(Json(tool.as_ref().clone()))
}

// ============================================================================
// Server Endpoints
// ============================================================================

/// GET /api/servers
pub async fn list_servers(State(state): State<Arc<AppState>>) -> Json<Vec<BackendStatus>> {
    Json(
        state
            .router
            .manager()
            .get_all_status()
            .into_values()
            .collect(),
    )
}

/// GET /api/servers/{server_id}
pub async fn get_server(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> ApiResult<Json<BackendStatus>> {
    let backend = state
        .router
        .manager()
        .get_backend(&server_id)
        .ok_or(BridgeError::ServerNotFound(server_id))?;
    Ok(Json(backend.status()))
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

/// PATCH /api/servers/{server_id} - `{"enabled": bool}` starts or stops a backend.
pub async fn toggle_server(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<BackendStatus>> {
    if state.router.is_shutting_down() {
        return Err(BridgeError::ShuttingDown.into());
    }
    let request: ToggleRequest = serde_json::from_slice(&body)
        .map_err(|e| BridgeError::InvalidRequest(format!("expected {{\"enabled\": bool}}: {e}")))?;

    let manager = state.router.manager();
    let registry = state.router.registry();
    let status = if request.enabled {
        tracing::info!(server = %server_id, "enabling server");
        manager.enable(&server_id, registry).await?
    } else {
        tracing::info!(server = %server_id, "disabling server");
        manager.disable(&server_id, registry).await?
    };
    Ok(Json(status))
}
