//! In-process overlay for local runs and tests.
//!
//! [`SimulatedOverlay`] behaves like a real overlay at the callback boundary:
//!
//! - callbacks arrive on the overlay's own OS threads, never on a tokio worker
//! - `join` returns immediately and reports progress later as health scores
//!   (an optional script is replayed from a background thread)
//! - `leave` fires one last network-status callback (`-1`) while tearing down
//!
//! Tests drive it further with [`report_health`](SimulatedOverlay::report_health),
//! [`deliver`](SimulatedOverlay::deliver) and
//! [`request_public_key`](SimulatedOverlay::request_public_key).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::identity::{NodeId, PublicKey};
use crate::keys::{GivePublicKey, KeyFetchError};
use crate::messages::{CloseNodesChange, OverlayEvent};
use crate::protocols::{Overlay, OverlayHandlers};

/// Health reported by the overlay while it shuts down.
pub const TEARDOWN_HEALTH: i32 = -1;

pub struct SimulatedOverlay {
    node_id: NodeId,
    health_script: Vec<i32>,
    step_delay: Duration,
    handlers: Mutex<Option<Arc<dyn OverlayHandlers>>>,
    joins: AtomicUsize,
    left: AtomicBool,
}

impl SimulatedOverlay {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            health_script: Vec::new(),
            step_delay: Duration::ZERO,
            handlers: Mutex::new(None),
            joins: AtomicUsize::new(0),
            left: AtomicBool::new(false),
        }
    }

    /// Report `scores` one after another, `step_delay` apart, once joined.
    pub fn with_health_script(mut self, scores: Vec<i32>, step_delay: Duration) -> Self {
        self.health_script = scores;
        self.step_delay = step_delay;
        self
    }

    pub fn is_joined(&self) -> bool {
        self.joins.load(Ordering::Acquire) > 0 && !self.has_left()
    }

    pub fn join_count(&self) -> usize {
        self.joins.load(Ordering::Acquire)
    }

    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::Acquire)
    }

    fn current_handlers(&self) -> Option<Arc<dyn OverlayHandlers>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run `f` against the registered handlers on a fresh overlay thread and
    /// wait for it to return.
    fn on_overlay_thread<F>(&self, f: F)
    where
        F: FnOnce(&dyn OverlayHandlers) + Send + 'static,
    {
        let Some(handlers) = self.current_handlers() else {
            trace!("no handlers registered; callback dropped");
            return;
        };
        let spawned = thread::Builder::new()
            .name("sim-overlay".to_string())
            .spawn(move || f(handlers.as_ref()));
        match spawned {
            Ok(thread) => {
                if thread.join().is_err() {
                    warn!("simulated overlay callback panicked");
                }
            }
            Err(e) => warn!(error = %e, "failed to spawn simulated overlay thread"),
        }
    }

    pub fn report_health(&self, health: i32) {
        self.on_overlay_thread(move |handlers| handlers.on_network_status(health));
    }

    pub fn deliver(&self, event: OverlayEvent) {
        self.on_overlay_thread(move |handlers| handlers.on_event(event));
    }

    pub fn close_nodes_changed(&self, change: CloseNodesChange) {
        self.on_overlay_thread(move |handlers| handlers.on_close_nodes_change(change));
    }

    /// Ask for `node_id`'s public key the way the overlay does and return
    /// the receiving end of the reply.
    pub fn request_public_key(
        &self,
        node_id: NodeId,
    ) -> oneshot::Receiver<Result<PublicKey, KeyFetchError>> {
        let (tx, rx) = oneshot::channel();
        let reply: GivePublicKey = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        self.deliver(OverlayEvent::RequestPublicKey { node_id, reply });
        rx
    }
}

impl Overlay for SimulatedOverlay {
    fn own_identity(&self) -> NodeId {
        self.node_id
    }

    fn join(&self, handlers: Arc<dyn OverlayHandlers>) {
        *self.handlers.lock().unwrap_or_else(|e| e.into_inner()) = Some(handlers.clone());
        self.joins.fetch_add(1, Ordering::AcqRel);
        debug!(node = ?self.node_id, steps = self.health_script.len(), "simulated overlay joining");

        if self.health_script.is_empty() {
            return;
        }
        let script = self.health_script.clone();
        let delay = self.step_delay;
        let spawned = thread::Builder::new()
            .name("sim-overlay-health".to_string())
            .spawn(move || {
                for health in script {
                    thread::sleep(delay);
                    handlers.on_network_status(health);
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn simulated health reporter");
        }
    }

    fn leave(&self) {
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner()).take();
        debug!(node = ?self.node_id, "simulated overlay leaving");
        // A real overlay reports its own disconnection while being destroyed.
        if let Some(handlers) = handlers {
            handlers.on_network_status(TEARDOWN_HEALTH);
        }
    }
}
