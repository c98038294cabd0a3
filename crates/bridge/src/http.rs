//! HTTP server and endpoints.

use crate::backend::{BackendState, BackendStatus};
use crate::router::ToolRouter;
use crate::session::{SessionInfo, SessionManager};
use crate::{openapi, rest, streamable};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Instant;

/// Shared application state.
pub struct AppState {
    pub router: Arc<ToolRouter>,
    pub sessions: Arc<SessionManager>,
    pub start_time: Instant,
    pub version: &'static str,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl AppState {
    pub fn new(router: Arc<ToolRouter>, sessions: Arc<SessionManager>) -> Self {
        Self {
            router,
            sessions,
            start_time: Instant::now(),
            version: crate::VERSION,
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        // Streaming MCP surface
        .route(
            "/mcp",
            post(streamable::handle_post)
                .get(streamable::handle_get)
                .delete(streamable::handle_delete),
        )
        // REST tool surface
        .route("/tools/openapi.json", get(openapi::tools_openapi))
        .route("/tools/{server_id}/{tool_name}", post(rest::call_tool))
        // Management API
        .route("/api/servers", get(rest::list_servers))
        .route(
            "/api/servers/{server_id}",
            get(rest::get_server).patch(rest::toggle_server),
        )
        .route("/api/tools", get(rest::list_tools))
        .route(
            "/api/tools/{server_id}/{tool_name}",
            get(rest::get_tool_schema).post(rest::call_tool_wrapped),
        )
        .with_state(state)
}

/// Attach request counting middleware (total + failed).
pub fn with_request_counting(router: Router, state: Arc<AppState>) -> Router {
    use axum::{
        body::Body,
        http::Request,
        middleware::{Next, from_fn_with_state},
        response::Response,
    };

    async fn count_requests(
        State(state): State<Arc<AppState>>,
        request: Request<Body>,
        next: Next,
    ) -> Response {
        let path = request.uri().path();
        let should_count = path != "/health" && path != "/ready";

        if should_count {
            state.total_requests.fetch_add(1, Ordering::Relaxed);
        }
        let response = next.run(request).await;
        if should_count && !response.status().is_success() {
            state.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        response
    }

    router.layer(from_fn_with_state(state, count_requests))
}

// ============================================================================
// Health Endpoints
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    servers_configured: usize,
    servers_enabled: usize,
    servers: BTreeMap<String, BackendState>,
}

/// GET /health - Always returns 200 while the bridge is running.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let statuses = state.router.manager().get_all_status();
    Json(HealthResponse {
        status: "healthy",
        servers_configured: statuses.len(),
        servers_enabled: statuses.values().filter(|s| s.enabled).count(),
        servers: statuses
            .into_iter()
            .map(|(id, s)| (id, s.state))
            .collect(),
    })
}

// ============================================================================
// Readiness Endpoint
// ============================================================================

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    servers: BTreeMap<String, BackendState>,
}

/// GET /ready - 200 when every enabled backend is ready.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let statuses = state.router.manager().get_all_status();

    let servers: BTreeMap<String, BackendState> = statuses
        .iter()
        .filter(|(_, s)| s.enabled)
        .map(|(id, s)| (id.clone(), s.state))
        .collect();

    // No enabled backends counts as ready.
    let all_ready = servers.values().all(|s| *s == BackendState::Ready);

    let response = ReadyResponse {
        status: if all_ready { "ready" } else { "not_ready" },
        servers,
    };

    if all_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

// ============================================================================
// Status Endpoint
// ============================================================================

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_seconds: u64,
    servers: BTreeMap<String, BackendStatus>,
    tool_count: usize,
    catalog_revision: u64,
    sessions: Vec<SessionInfo>,
    stats: StatsInfo,
}

#[derive(Serialize)]
struct StatsInfo {
    total_requests: u64,
    failed_requests: u64,
}

/// GET /status - Detailed status information.
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let catalog = state.router.registry().snapshot();
    Json(StatusResponse {
        version: state.version,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        servers: state.router.manager().get_all_status(),
        tool_count: catalog.len(),
        catalog_revision: catalog.revision(),
        sessions: state.sessions.list(),
        stats: StatsInfo {
            total_requests: state.total_requests.load(Ordering::Relaxed),
            failed_requests: state.failed_requests.load(Ordering::Relaxed),
        },
    })
}
