//! # Public-Key Request Registry
//!
//! The overlay asks "give me this peer's public key" from its own threads and
//! hands over a one-shot reply callback. The registry turns each request into
//! an asynchronous fetch on the key/data engine and guarantees the callback
//! runs exactly once: with the key, with the fetch error, or with a timeout.
//!
//! ## Lifecycle of a request
//!
//! ```text
//! request_key ──▶ pending[id] = (node_id, fetch task, reply)
//!                          │
//!      fetch resolves / times out / cancel_all
//!                          │
//!                 remove pending[id]  ──▶ reply(outcome) on the executor
//! ```
//!
//! Whoever removes the entry owns the reply, so a fetch finishing at the same
//! moment as a shutdown cannot answer twice.
//!
//! Requests are keyed by a registry-assigned id, not by `NodeId`: two
//! concurrent requests for the same peer are two fetches and two replies.
//!
//! SECURITY: the number of requests in flight is bounded. Requests past the
//! bound are refused immediately with [`KeyFetchError::Overloaded`]; the
//! overlay callback is never blocked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::executor::AsyncExecutor;
use crate::identity::{NodeId, PublicKey};
use crate::protocols::KeyDataEngine;

/// One-shot reply supplied by the overlay with each public-key request.
pub type GivePublicKey = Box<dyn FnOnce(Result<PublicKey, KeyFetchError>) + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyFetchError {
    #[error("public key fetch for {node_id} failed: {reason}")]
    Failed { node_id: NodeId, reason: String },

    #[error("public key fetch for {node_id} timed out after {timeout:?}")]
    TimedOut { node_id: NodeId, timeout: Duration },

    #[error("too many pending public key requests (limit {limit})")]
    Overloaded { limit: usize },

    #[error("key registry is shutting down")]
    ShuttingDown,
}

struct PendingKeyRequest {
    node_id: NodeId,
    fetch: Option<JoinHandle<()>>,
    reply: GivePublicKey,
    started: Instant,
}

#[derive(Clone)]
pub struct KeyRequestRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    engine: Arc<dyn KeyDataEngine>,
    executor: AsyncExecutor,
    /// Fetch tasks are spawned here; `request_key` runs on overlay threads
    /// that have no runtime of their own.
    runtime: Handle,
    timeout: Duration,
    capacity: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
    pending: Mutex<HashMap<u64, PendingKeyRequest>>,
}

impl KeyRequestRegistry {
    /// Must be called from within a tokio runtime.
    pub fn new(
        engine: Arc<dyn KeyDataEngine>,
        executor: AsyncExecutor,
        timeout: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                engine,
                executor,
                runtime: Handle::current(),
                timeout,
                capacity,
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start fetching `node_id`'s key; `reply` is invoked exactly once.
    pub fn request_key(&self, node_id: NodeId, reply: GivePublicKey) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            inner.deliver(reply, Err(KeyFetchError::ShuttingDown));
            return;
        }

        let id = {
            let mut pending = inner.lock_pending();
            if pending.len() >= inner.capacity {
                drop(pending);
                warn!(
                    node = ?node_id,
                    limit = inner.capacity,
                    "refusing public key request: registry full"
                );
                let limit = inner.capacity;
                inner.deliver(reply, Err(KeyFetchError::Overloaded { limit }));
                return;
            }
            let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            pending.insert(
                id,
                PendingKeyRequest {
                    node_id,
                    fetch: None,
                    reply,
                    started: Instant::now(),
                },
            );
            id
        };
        trace!(request = id, node = ?node_id, "public key request registered");

        let task = {
            let inner = inner.clone();
            inner.runtime.clone().spawn(async move {
                let outcome = inner.fetch(node_id).await;
                inner.complete(id, outcome);
            })
        };

        // The fetch may already have completed (and removed its entry); the
        // handle is then simply dropped.
        if let Some(entry) = inner.lock_pending().get_mut(&id) {
            entry.fetch = Some(task);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// Abort every in-flight fetch and answer its reply with
    /// [`KeyFetchError::ShuttingDown`]. Later requests are refused the same way.
    pub fn cancel_all(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);

        let drained: Vec<(u64, PendingKeyRequest)> = inner.lock_pending().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "cancelling pending public key requests");
        }
        for (id, entry) in drained {
            if let Some(fetch) = entry.fetch {
                fetch.abort();
            }
            trace!(request = id, node = ?entry.node_id, "public key request cancelled");
            inner.deliver(entry.reply, Err(KeyFetchError::ShuttingDown));
        }
    }
}

/// Aborts the engine fetch when the request is answered or cancelled first.
struct AbortOnDrop(JoinHandle<anyhow::Result<PublicKey>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl RegistryInner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingKeyRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fetch(&self, node_id: NodeId) -> Result<PublicKey, KeyFetchError> {
        let timeout = self.timeout;
        let engine = self.engine.clone();
        // The engine runs in its own task so a panic surfaces as a JoinError
        // here instead of unwinding through the completion path.
        let mut fetch = AbortOnDrop(
            self.runtime
                .spawn(async move { engine.fetch_public_key(node_id, timeout).await }),
        );

        match tokio::time::timeout(timeout, &mut fetch.0).await {
            Ok(Ok(Ok(key))) => Ok(key),
            Ok(Ok(Err(e))) => match e.downcast::<KeyFetchError>() {
                Ok(typed) => Err(typed),
                Err(e) => Err(KeyFetchError::Failed {
                    node_id,
                    reason: format!("{:#}", e),
                }),
            },
            Ok(Err(e)) => {
                let reason = if e.is_panic() {
                    "fetch task panicked"
                } else {
                    "fetch task cancelled"
                };
                warn!(node = ?node_id, reason, "public key fetch ended abnormally");
                Err(KeyFetchError::Failed {
                    node_id,
                    reason: reason.to_string(),
                })
            }
            Err(_) => Err(KeyFetchError::TimedOut { node_id, timeout }),
        }
    }

    fn complete(&self, id: u64, outcome: Result<PublicKey, KeyFetchError>) {
        let Some(entry) = self.lock_pending().remove(&id) else {
            // Already answered by cancel_all.
            return;
        };
        match &outcome {
            Ok(_) => debug!(
                request = id,
                node = ?entry.node_id,
                elapsed_ms = entry.started.elapsed().as_millis() as u64,
                "public key resolved"
            ),
            Err(e) => debug!(
                request = id,
                node = ?entry.node_id,
                error = %e,
                "public key request failed"
            ),
        }
        self.deliver(entry.reply, outcome);
    }

    /// Run `reply` on the executor, or inline once the executor is gone.
    fn deliver(&self, reply: GivePublicKey, outcome: Result<PublicKey, KeyFetchError>) {
        if let Err(closed) = self.executor.post_completion(move || reply(outcome)) {
            (closed.into_task())();
        }
    }
}
