//! Tool call routing shared by the REST and streaming surfaces.

use crate::backend::BackendState;
use crate::error::{BridgeError, Result};
use crate::registry::{RegisteredTool, ToolRegistry};
use crate::supervisor::BackendManager;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::Instrument as _;

/// Which tool to call.
#[derive(Debug, Clone, Copy)]
pub enum CallTarget<'a> {
    Namespaced(&'a str),
    Pair { server_id: &'a str, local_name: &'a str },
}

pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
    manager: Arc<BackendManager>,
    shutting_down: AtomicBool,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl ToolRouter {
    pub fn new(
        registry: Arc<ToolRegistry>,
        manager: Arc<BackendManager>,
        default_timeout: Duration,
        max_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            manager,
            shutting_down: AtomicBool::new(false),
            default_timeout: default_timeout.min(max_timeout),
            max_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<BackendManager> {
        &self.manager
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    /// Reject every call from now on.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn resolve(&self, target: CallTarget<'_>) -> Result<Arc<RegisteredTool>> {
        match target {
            CallTarget::Namespaced(name) => self.registry.resolve(name),
            CallTarget::Pair {
                server_id,
                local_name,
            } => self.registry.resolve_pair(server_id, local_name),
        }
    }

    /// Resolve, check the owning backend, and forward `tools/call`. Returns the raw result.
    ///
    /// `timeout` of `None` uses the configured default; anything longer than the max is clamped.
    pub async fn call(
        &self,
        target: CallTarget<'_>,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.is_shutting_down() {
            return Err(BridgeError::ShuttingDown);
        }

        let tool = self.resolve(target)?;
        let backend = self
            .manager
            .get_backend(&tool.server_id)
            .ok_or_else(|| BridgeError::unavailable(&tool.server_id, "backend not configured"))?;

        let state = backend.state();
        if state != BackendState::Ready {
            return Err(BridgeError::unavailable(
                &tool.server_id,
                format!("backend is {state}"),
            ));
        }

        let timeout = timeout.unwrap_or(self.default_timeout).min(self.max_timeout);
        let span = tracing::info_span!(
            "tool_call",
            server = %tool.server_id,
            tool = %tool.local_name,
        );

        async {
            let started = Instant::now();
            let result = backend.call_tool(&tool.local_name, arguments, timeout).await;
            let elapsed_ms = started.elapsed().as_millis();
            match &result {
                Ok(_) => tracing::debug!(elapsed_ms, "tool call completed"),
                Err(e) => tracing::warn!(elapsed_ms, error = %e, kind = %e.kind(), "tool call failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rmcp::model::Tool;
    use serde_json::json;

    fn router() -> ToolRouter {
        let registry = Arc::new(ToolRegistry::new());
        registry.replace_server(
            "ghost",
            vec![Tool::new(
                "boo".to_string(),
                String::new(),
                Arc::new(serde_json::Map::new()),
            )],
        );
        ToolRouter::new(
            registry,
            Arc::new(BackendManager::new()),
            Duration::from_secs(90),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let router = router();
        let err = router
            .call(CallTarget::Namespaced("git__status"), json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);
        assert_eq!(router.default_timeout(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn tool_without_backend_is_unavailable() {
        let router = router();
        let err = router
            .call(
                CallTarget::Pair {
                    server_id: "ghost",
                    local_name: "boo",
                },
                json!({}),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }

    #[tokio::test]
    async fn shutdown_rejects_calls() {
        let router = router();
        router.begin_shutdown();
        let err = router
            .call(CallTarget::Namespaced("ghost__boo"), json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShuttingDown);
    }
}
