//! # Join Coordination
//!
//! ```text
//!          start_join            health >= 100
//!   Idle ─────────────▶ Joining ───────────────▶ Connected
//!                          │
//!                          │ health < -300000 (or join timeout)
//!                          ▼
//!                     Disconnected
//! ```
//!
//! There is no way back to `Idle`: a failed join means building a new
//! account getter.
//!
//! ## Handler table
//!
//! `start_join` hands the overlay a [`HandlerTable`]. It holds only the
//! pieces of state the callbacks need (health, executor, dispatcher) plus an
//! [`Attachment`] flag. Teardown detaches the table before the overlay is
//! released, after which every callback (including the final network-status
//! report the overlay fires while shutting down) is a no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::dispatch::MessageDispatcher;
use crate::error::LauncherError;
use crate::executor::AsyncExecutor;
use crate::health::{HealthResolution, HealthState};
use crate::identity::NodeId;
use crate::keys::KeyFetchError;
use crate::messages::{CloseNodesChange, OverlayEvent};
use crate::protocols::{Overlay, OverlayHandlers};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    Joining,
    Connected,
    Disconnected,
}

/// Shared "callbacks may still touch launcher state" flag.
#[derive(Clone, Debug)]
pub struct Attachment(Arc<AtomicBool>);

impl Default for Attachment {
    fn default() -> Self {
        Self::new()
    }
}

impl Attachment {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_attached(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns `true` if this call performed the detach.
    pub fn detach(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// The callbacks registered with the overlay on join.
pub struct HandlerTable {
    /// Copied before join; the overlay may be half torn down when it calls us.
    own_id: NodeId,
    health: HealthState,
    executor: AsyncExecutor,
    dispatcher: Arc<MessageDispatcher>,
    attachment: Attachment,
}

impl OverlayHandlers for HandlerTable {
    fn on_network_status(&self, health: i32) {
        if !self.attachment.is_attached() {
            trace!(health, "network status after detach ignored");
            return;
        }
        let state = self.health.clone();
        let attachment = self.attachment.clone();
        let own_id = self.own_id;
        let posted = self.executor.post(move || {
            // Detach may have happened while this update sat in the queue.
            if attachment.is_attached() {
                state.apply_update(health, own_id);
            }
        });
        if posted.is_err() {
            trace!(health, "network status after executor shutdown ignored");
        }
    }

    fn on_event(&self, event: OverlayEvent) {
        if self.attachment.is_attached() {
            self.dispatcher.dispatch(event);
            return;
        }
        match event {
            // The reply contract holds even after detach.
            OverlayEvent::RequestPublicKey { node_id, reply } => {
                trace!(node = ?node_id, "public key request after detach refused");
                reply(Err(KeyFetchError::ShuttingDown));
            }
            OverlayEvent::MessageReceived(_) | OverlayEvent::PutCacheData(_) => {
                trace!(category = %event.category(), "overlay event after detach dropped");
            }
        }
    }

    fn on_close_nodes_change(&self, change: CloseNodesChange) {
        trace!(
            old = change.old_close_nodes.len(),
            new = change.new_close_nodes.len(),
            "close nodes changed"
        );
    }
}

pub struct JoinCoordinator {
    overlay: Arc<dyn Overlay>,
    dispatcher: Arc<MessageDispatcher>,
    health: HealthState,
    executor: AsyncExecutor,
    attachment: Attachment,
    join_timeout: Option<Duration>,
    state: JoinState,
    own_id: Option<NodeId>,
}

impl JoinCoordinator {
    pub fn new(
        overlay: Arc<dyn Overlay>,
        dispatcher: Arc<MessageDispatcher>,
        health: HealthState,
        executor: AsyncExecutor,
        attachment: Attachment,
        join_timeout: Option<Duration>,
    ) -> Self {
        Self {
            overlay,
            dispatcher,
            health,
            executor,
            attachment,
            join_timeout,
            state: JoinState::Idle,
            own_id: None,
        }
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    pub fn own_identity(&self) -> Option<NodeId> {
        self.own_id
    }

    /// Register the handler table with the overlay and trigger the join.
    pub fn start_join(&mut self) -> Result<(), LauncherError> {
        if self.state != JoinState::Idle {
            return Err(LauncherError::InvalidJoinState(self.state));
        }

        let own_id = self.overlay.own_identity();
        self.own_id = Some(own_id);

        let handlers = Arc::new(HandlerTable {
            own_id,
            health: self.health.clone(),
            executor: self.executor.clone(),
            dispatcher: self.dispatcher.clone(),
            attachment: self.attachment.clone(),
        });

        self.state = JoinState::Joining;
        debug!(node = ?own_id, "joining overlay");
        self.overlay.join(handlers);
        Ok(())
    }

    /// Wait for the join to resolve. Single attempt: no retry on failure.
    pub async fn await_resolution(&mut self) -> Result<NodeId, LauncherError> {
        let (JoinState::Joining, Some(own_id)) = (self.state, self.own_id) else {
            return Err(LauncherError::InvalidJoinState(self.state));
        };

        let resolution = match self.join_timeout {
            Some(limit) => match self.health.wait_until_resolved_for(limit).await {
                Some(resolution) => resolution,
                None => {
                    self.state = JoinState::Disconnected;
                    warn!(
                        timeout = ?limit,
                        health = self.health.current(),
                        "overlay join timed out"
                    );
                    return Err(LauncherError::JoinTimedOut(limit));
                }
            },
            None => self.health.wait_until_resolved().await,
        };

        match resolution {
            HealthResolution::Connected(score) => {
                self.state = JoinState::Connected;
                info!(node = ?own_id, health = score, "joined overlay");
                Ok(own_id)
            }
            HealthResolution::Disconnected(score) => {
                self.state = JoinState::Disconnected;
                warn!(node = ?own_id, health = score, "failed to join overlay");
                Err(LauncherError::NotConnected { health: score })
            }
        }
    }

    /// `start_join` followed by `await_resolution`.
    pub async fn join(&mut self) -> Result<NodeId, LauncherError> {
        self.start_join()?;
        self.await_resolution().await
    }
}
