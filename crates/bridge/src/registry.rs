//! Aggregate tool catalog.
//!
//! The catalog is an immutable snapshot behind an `Arc`; readers clone the `Arc` and never block
//! writers for longer than a pointer swap.

use crate::backend::{Backend, BackendState};
use crate::config::NAMESPACE_SEPARATOR;
use crate::error::{BridgeError, Result};
use crate::supervisor::{BackendEvent, BackendManager};
use parking_lot::{Mutex, RwLock};
use rmcp::model::Tool;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// A tool exposed through the bridge.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredTool {
    pub server_id: String,
    pub local_name: String,
    pub namespaced_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[must_use]
pub fn namespaced_name(server_id: &str, local_name: &str) -> String {
    format!("{server_id}{NAMESPACE_SEPARATOR}{local_name}")
}

/// Split a namespaced name at the first separator.
#[must_use]
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
        .filter(|(server, local)| !server.is_empty() && !local.is_empty())
}

// ============================================================================
// Snapshot
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    revision: u64,
    /// namespaced name -> tool
    tools: BTreeMap<String, Arc<RegisteredTool>>,
    /// server id -> namespaced names, in backend order
    by_server: BTreeMap<String, Vec<String>>,
}

impl CatalogSnapshot {
    /// Bumped on every change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, namespaced: &str) -> Option<&Arc<RegisteredTool>> {
        self.tools.get(namespaced)
    }

    /// All tools, ordered by namespaced name.
    pub fn tools(&self) -> impl Iterator<Item = &Arc<RegisteredTool>> {
        self.tools.values()
    }

    /// Case-insensitive substring match over namespaced name and description.
    pub fn search(&self, query: &str) -> Vec<Arc<RegisteredTool>> {
        let query = query.to_lowercase();
        self.tools
            .values()
            .filter(|tool| {
                tool.namespaced_name.to_lowercase().contains(&query)
                    || tool
                        .description
                        .as_ref()
                        .is_some_and(|d| d.to_lowercase().contains(&query))
            })
            .cloned()
            .collect()
    }

    fn without_server(&self, server_id: &str) -> Self {
        let mut next = self.clone();
        if let Some(names) = next.by_server.remove(server_id) {
            for name in names {
                next.tools.remove(&name);
            }
        }
        next.revision += 1;
        next
    }
}

/// Keep the first occurrence of each local name.
fn dedupe_tools(server_id: &str, tools: Vec<Tool>) -> Vec<Tool> {
    let mut seen = BTreeSet::new();
    tools
        .into_iter()
        .filter(|tool| {
            let first = seen.insert(tool.name.to_string());
            if !first {
                tracing::warn!(
                    server = server_id,
                    tool = %tool.name,
                    "duplicate tool name from backend; keeping the first"
                );
            }
            first
        })
        .collect()
}

// ============================================================================
// Registry
// ============================================================================

pub struct ToolRegistry {
    current: RwLock<Arc<CatalogSnapshot>>,
    /// Serializes writers so two slice updates never race on the same base snapshot.
    update: Mutex<()>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot::default())),
            update: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.read().clone()
    }

    /// Replace one server's slice. Returns the number of tools registered for it.
    pub fn replace_server(&self, server_id: &str, tools: Vec<Tool>) -> usize {
        let tools = dedupe_tools(server_id, tools);
        let _update = self.update.lock();
        let mut next = self.snapshot().without_server(server_id);

        let mut names = Vec::with_capacity(tools.len());
        for tool in tools {
            let local_name = tool.name.into_owned();
            let namespaced = namespaced_name(server_id, &local_name);
            next.tools.insert(
                namespaced.clone(),
                Arc::new(RegisteredTool {
                    server_id: server_id.to_string(),
                    local_name,
                    namespaced_name: namespaced.clone(),
                    description: tool.description.map(Cow::into_owned),
                    input_schema: Value::Object(Arc::unwrap_or_clone(tool.input_schema)),
                }),
            );
            names.push(namespaced);
        }

        let count = names.len();
        next.by_server.insert(server_id.to_string(), names);
        *self.current.write() = Arc::new(next);
        count
    }

    /// Drop one server's slice. Returns how many tools were removed.
    pub fn remove_server(&self, server_id: &str) -> usize {
        let _update = self.update.lock();
        let current = self.snapshot();
        let Some(names) = current.by_server.get(server_id) else {
            return 0;
        };
        let removed = names.len();
        *self.current.write() = Arc::new(current.without_server(server_id));
        if removed > 0 {
            tracing::info!(server = server_id, removed, "removed tools from catalog");
        }
        removed
    }

    pub fn resolve(&self, namespaced: &str) -> Result<Arc<RegisteredTool>> {
        self.snapshot()
            .get(namespaced)
            .cloned()
            .ok_or_else(|| BridgeError::ToolNotFound {
                name: namespaced.to_string(),
            })
    }

    pub fn resolve_pair(&self, server_id: &str, local_name: &str) -> Result<Arc<RegisteredTool>> {
        self.resolve(&namespaced_name(server_id, local_name))
    }

    /// Re-list a backend's tools and update its slice and state accordingly.
    pub async fn refresh_backend(&self, backend: &Arc<dyn Backend>) -> Result<usize> {
        let id = backend.id().to_string();
        let generation = backend.generation();

        match backend.list_tools().await {
            Ok(tools) => {
                let tools = dedupe_tools(&id, tools);
                let count = tools.len();
                // Ready before published, so advertised tools are always callable. The process
                // may have exited while we were listing.
                if !backend.mark_ready(generation, count) {
                    self.remove_server(&id);
                    return Err(BridgeError::unavailable(
                        &id,
                        "backend stopped during tool listing",
                    ));
                }
                self.replace_server(&id, tools);
                // An exit between the two steps may already have been processed.
                if backend.generation() != generation || backend.state() != BackendState::Ready {
                    self.remove_server(&id);
                    return Err(BridgeError::unavailable(
                        &id,
                        "backend stopped during tool listing",
                    ));
                }
                tracing::info!("Registered {} tool(s) from '{}'", count, id);
                Ok(count)
            }
            Err(e) => {
                self.remove_server(&id);
                backend.mark_degraded(generation, &e.to_string());
                tracing::warn!(server = %id, error = %e, "tool listing failed");
                Err(e)
            }
        }
    }

    /// Start a backend and register its tools.
    pub async fn activate(&self, backend: &Arc<dyn Backend>) -> Result<usize> {
        if let Err(e) = backend.start().await {
            tracing::error!("Failed to start MCP server '{}': {}", backend.id(), e);
            return Err(e);
        }
        self.refresh_backend(backend).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Refresh loop
// ============================================================================

/// Consume backend events and keep the catalog in step. Bursts are coalesced per server.
pub fn spawn_registry_refresh_loop(
    manager: Arc<BackendManager>,
    registry: Arc<ToolRegistry>,
    mut events: UnboundedReceiver<BackendEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(first) = events.recv().await {
            let mut batch = vec![first];
            while let Ok(next) = events.try_recv() {
                batch.push(next);
            }

            // server -> (exited generations, refresh requested for generation)
            let mut exited: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
            let mut refresh: BTreeMap<String, u64> = BTreeMap::new();
            for event in batch {
                match event {
                    BackendEvent::Exited { server, generation } => {
                        exited.entry(server).or_default().insert(generation);
                    }
                    BackendEvent::ToolsChanged { server, generation } => {
                        refresh.insert(server, generation);
                    }
                }
            }

            for (server, generations) in exited {
                let Some(backend) = manager.get_backend(&server) else {
                    continue;
                };
                if generations.contains(&backend.generation()) {
                    registry.remove_server(&server);
                }
            }

            for (server, generation) in refresh {
                let Some(backend) = manager.get_backend(&server) else {
                    continue;
                };
                let live = matches!(
                    backend.state(),
                    BackendState::Ready | BackendState::Degraded
                );
                if !live || backend.generation() != generation {
                    tracing::debug!(server = %server, "skipping refresh for stale event");
                    continue;
                }
                // Errors are logged and reflected in the backend state.
                let _ = registry.refresh_backend(&backend).await;
            }
        }
        tracing::debug!("registry refresh loop finished");
    })
}

// ============================================================================
// Tests
// ============================================================================
