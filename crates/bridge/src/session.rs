//! Streaming-surface sessions.

use crate::error::{BridgeError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long a closed session id is still reported as expired rather than unknown.
pub const TOMBSTONE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initialized,
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub protocol_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Session {
    info: SessionInfo,
    last_active: Instant,
}

#[derive(Debug, Default)]
struct Sessions {
    live: HashMap<String, Session>,
    /// Closed id -> when it was closed.
    tombstones: HashMap<String, Instant>,
}

pub struct SessionManager {
    inner: Mutex<Sessions>,
    idle_timeout: Duration,
    tombstone_retention: Duration,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self::with_tombstone_retention(idle_timeout, TOMBSTONE_RETENTION)
    }

    pub fn with_tombstone_retention(idle_timeout: Duration, tombstone_retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Sessions::default()),
            idle_timeout,
            tombstone_retention,
        }
    }

    /// Allocate a fresh session after a successful `initialize`.
    pub fn create(&self, client_info: Option<Value>, protocol_version: &str) -> String {
        let mut inner = self.inner.lock();
        let id = loop {
            let candidate = uuid::Uuid::new_v4().simple().to_string();
            if !inner.live.contains_key(&candidate) && !inner.tombstones.contains_key(&candidate) {
                break candidate;
            }
        };

        let now = Utc::now();
        inner.live.insert(
            id.clone(),
            Session {
                info: SessionInfo {
                    id: id.clone(),
                    state: SessionState::Initialized,
                    protocol_version: protocol_version.to_string(),
                    client_info,
                    created_at: now,
                    last_active_at: now,
                },
                last_active: Instant::now(),
            },
        );
        tracing::info!(session = %id, "session initialized");
        id
    }

    /// Validate a session id and refresh its activity timestamp.
    ///
    /// A session idle past the timeout is closed here even if the sweeper has not run yet.
    pub fn touch(&self, id: &str) -> Result<SessionState> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let Some(session) = inner.live.get_mut(id) else {
            return Err(if inner.tombstones.contains_key(id) {
                BridgeError::SessionExpired
            } else {
                BridgeError::SessionNotInitialized
            });
        };

        if now.duration_since(session.last_active) > self.idle_timeout {
            inner.live.remove(id);
            inner.tombstones.insert(id.to_string(), now);
            tracing::info!(session = %id, "session expired");
            return Err(BridgeError::SessionExpired);
        }

        session.last_active = now;
        session.info.last_active_at = Utc::now();
        Ok(session.info.state)
    }

    /// `initialized -> active`; a no-op for active sessions.
    pub fn mark_active(&self, id: &str) {
        if let Some(session) = self.inner.lock().live.get_mut(id)
            && session.info.state == SessionState::Initialized
        {
            session.info.state = SessionState::Active;
            tracing::debug!(session = %id, "session active");
        }
    }

    /// Explicit close. Returns false for unknown or already-closed ids.
    pub fn close(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.live.remove(id).is_none() {
            return false;
        }
        inner.tombstones.insert(id.to_string(), Instant::now());
        tracing::info!(session = %id, "session closed");
        true
    }

    /// Close sessions idle longer than the timeout and prune old tombstones.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired: Vec<String> = inner
            .live
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_active) > self.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.live.remove(id);
            inner.tombstones.insert(id.clone(), now);
        }

        let retention = self.tombstone_retention;
        inner
            .tombstones
            .retain(|_, closed_at| now.duration_since(*closed_at) <= retention);

        if !expired.is_empty() {
            tracing::info!(expired = expired.len(), "closed idle sessions");
        }
        expired.len()
    }

    pub fn close_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let ids: Vec<String> = inner.live.drain().map(|(id, _)| id).collect();
        for id in &ids {
            inner.tombstones.insert(id.clone(), now);
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().live.is_empty()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .inner
            .lock()
            .live
            .values()
            .map(|s| s.info.clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Run [`SessionManager::sweep`] every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let sessions = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        sessions.sweep();
                    }
                }
            }
        })
    }
}
