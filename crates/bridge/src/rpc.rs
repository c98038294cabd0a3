//! Request/response correlation over a backend's stdio pipes.
//!
//! One [`RpcChannel`] exists per running backend process. It owns:
//! - a single writer task fed by an unbounded queue (so lines are never interleaved),
//! - a single reader task that frames newline-delimited JSON and completes pending calls,
//! - the pending-call table for that backend (request ids are unique per channel).

use crate::error::{BridgeError, Result};
use crate::jsonrpc::{self, Inbound, error_codes};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader};
use tokio::sync::{mpsc, oneshot};

/// A notification received from a backend, forwarded to whoever subscribed.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundNotification {
    pub method: String,
    pub params: Option<Value>,
}

type Waiter = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct PendingTable {
    /// Set once; every later request fails with a clone of this error.
    closed: Option<BridgeError>,
    calls: HashMap<u64, Waiter>,
}

pub struct RpcChannel {
    server: Arc<str>,
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    outbound: mpsc::UnboundedSender<String>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("server", &self.server)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl RpcChannel {
    /// Start the reader and writer tasks over an already-connected byte stream.
    pub fn spawn<R, W>(
        server: &str,
        reader: R,
        writer: W,
        notifications: Option<mpsc::UnboundedSender<InboundNotification>>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<String>();
        let channel = Arc::new(Self {
            server: Arc::from(server),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
            outbound,
        });

        tokio::spawn(write_loop(Arc::downgrade(&channel), writer, outbound_rx));
        tokio::spawn(read_loop(Arc::clone(&channel), reader, notifications));

        channel
    }

    /// Send a request and wait for its correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut table = self.pending.lock();
            if let Some(err) = &table.closed {
                return Err(err.clone());
            }
            table.calls.insert(id, tx);
        }
        let mut guard = PendingGuard {
            channel: self,
            id,
            armed: true,
        };

        let line = jsonrpc::encode_request(id, method, params.as_ref());
        if self.outbound.send(line).is_err() {
            guard.armed = false;
            self.pending.lock().calls.remove(&id);
            return Err(BridgeError::unavailable(&self.server, "input stream closed"));
        }

        tracing::trace!(server = %self.server, id, method, "sent request");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => {
                guard.armed = false;
                outcome
            }
            Ok(Err(_)) => {
                guard.armed = false;
                Err(BridgeError::unavailable(&self.server, "request abandoned"))
            }
            Err(_) => {
                tracing::warn!(
                    server = %self.server,
                    id,
                    method,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "request timed out"
                );
                drop(guard);
                Err(BridgeError::CallTimeout {
                    server: self.server.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if let Some(err) = &self.pending.lock().closed {
            return Err(err.clone());
        }
        let line = jsonrpc::encode_notification(method, params.as_ref());
        self.outbound
            .send(line)
            .map_err(|_| BridgeError::unavailable(&self.server, "input stream closed"))
    }

    /// Mark the channel closed and fail every pending call with `error`.
    ///
    /// Only the first close wins; returns the number of calls that were failed.
    pub fn close(&self, error: BridgeError) -> usize {
        let drained: Vec<Waiter> = {
            let mut table = self.pending.lock();
            if table.closed.is_none() {
                table.closed = Some(error.clone());
            }
            table.calls.drain().map(|(_, waiter)| waiter).collect()
        };
        let failed = drained.len();
        for waiter in drained {
            let _ = waiter.send(Err(error.clone()));
        }
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed.is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().calls.len()
    }

    fn complete(&self, id: u64, outcome: Result<Value>) {
        let waiter = self.pending.lock().calls.remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => {
                tracing::debug!(server = %self.server, id, "response for unknown or abandoned request");
            }
        }
    }

    fn dispatch_line(
        &self,
        line: &str,
        notifications: Option<&mpsc::UnboundedSender<InboundNotification>>,
    ) {
        let message = match jsonrpc::parse_inbound(line) {
            Ok(message) => message,
            Err(reason) => {
                tracing::warn!(server = %self.server, %reason, "discarding malformed line from backend");
                return;
            }
        };

        match message {
            Inbound::Response { id, outcome } => {
                let outcome = outcome.map_err(|e| BridgeError::Upstream {
                    server: self.server.to_string(),
                    code: e.code,
                    message: e.message,
                    data: e.data,
                });
                self.complete(id, outcome);
            }
            Inbound::ForeignResponse { id } => {
                tracing::debug!(server = %self.server, %id, "dropping response with foreign id");
            }
            Inbound::Notification { method, params } => match notifications {
                Some(tx) => {
                    let _ = tx.send(InboundNotification { method, params });
                }
                None => tracing::debug!(server = %self.server, %method, "dropping notification"),
            },
            Inbound::Request { id, method, .. } => self.answer_backend_request(&id, &method),
            Inbound::Invalid { id, reason } => {
                tracing::warn!(server = %self.server, ?id, %reason, "malformed message from backend");
                if let Some(id) = id {
                    self.complete(id, Err(BridgeError::malformed(&self.server, reason)));
                }
            }
        }
    }

    /// Backends may ask the client things (ping, roots, sampling). Only ping is supported.
    fn answer_backend_request(&self, id: &Value, method: &str) {
        let reply = if method == "ping" {
            jsonrpc::success_response(id, json!({}))
        } else {
            tracing::debug!(server = %self.server, method, "rejecting backend-initiated request");
            jsonrpc::error_response(
                id,
                &jsonrpc::ErrorObject {
                    code: error_codes::METHOD_NOT_FOUND,
                    message: format!("method not supported by bridge: {method}"),
                    data: None,
                },
            )
        };
        let _ = self.outbound.send(reply.to_string());
    }
}

/// Removes a pending entry when the waiting future is dropped or times out.
struct PendingGuard<'a> {
    channel: &'a RpcChannel,
    id: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = self.channel.pending.lock().calls.remove(&self.id).is_some();
        if removed {
            let params = json!({ "requestId": self.id, "reason": "cancelled by bridge" });
            let line = jsonrpc::encode_notification("notifications/cancelled", Some(&params));
            let _ = self.channel.outbound.send(line);
        }
    }
}

async fn read_loop<R>(
    channel: Arc<RpcChannel>,
    reader: R,
    notifications: Option<mpsc::UnboundedSender<InboundNotification>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf: Vec<u8> = Vec::with_capacity(4096);

    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break "backend closed its output stream".to_string(),
            Ok(_) => {}
            Err(e) => break format!("read error: {e}"),
        }

        let Ok(line) = std::str::from_utf8(&buf) else {
            tracing::warn!(server = %channel.server, "discarding non-UTF-8 line from backend");
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        channel.dispatch_line(line, notifications.as_ref());
    };

    let failed = channel.close(BridgeError::unavailable(&channel.server, reason.clone()));
    tracing::debug!(server = %channel.server, %reason, failed, "reader stopped");
}

async fn write_loop<W>(
    channel: Weak<RpcChannel>,
    writer: W,
    mut outbound: mpsc::UnboundedReceiver<String>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer = tokio::io::BufWriter::new(writer);
    while let Some(line) = outbound.recv().await {
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            if let Some(channel) = channel.upgrade() {
                tracing::warn!(server = %channel.server, error = %e, "write to backend failed");
                channel.close(BridgeError::unavailable(
                    &channel.server,
                    format!("write error: {e}"),
                ));
            }
            break;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
