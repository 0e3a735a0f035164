//! Trait definitions for the launcher's two external collaborators.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Overlay network | [`Overlay`] | join, own identity, release |
//! | Handler table | [`OverlayHandlers`] | callbacks the overlay invokes on its own threads |
//! | Key/data engine | [`KeyDataEngine`] | public-key fetches, message handling, shutdown |
//!
//! Both collaborators are supplied by the caller through
//! [`Backend`](crate::Backend), so a live overlay and the in-memory store are
//! interchangeable at runtime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{NodeId, PublicKey};
use crate::messages::{CloseNodesChange, Message, OverlayEvent};

/// The overlay network this client joins.
pub trait Overlay: Send + Sync + 'static {
    /// This node's identity on the overlay. Queried once, before `join`.
    fn own_identity(&self) -> NodeId;

    /// Register `handlers` and start joining.
    ///
    /// Returns immediately; progress is reported later through
    /// [`OverlayHandlers::on_network_status`].
    fn join(&self, handlers: Arc<dyn OverlayHandlers>);

    /// Release the overlay. Implementations may deliver one last
    /// network-status callback from inside this call.
    fn leave(&self);
}

/// Callbacks the overlay invokes, from its own threads, at arbitrary times.
pub trait OverlayHandlers: Send + Sync {
    fn on_network_status(&self, health: i32);

    fn on_event(&self, event: OverlayEvent);

    fn on_close_nodes_change(&self, change: CloseNodesChange);
}

/// Content and public-key retrieval over the overlay.
#[async_trait]
pub trait KeyDataEngine: Send + Sync + 'static {
    /// Fetch `node_id`'s public key, giving up after `timeout`.
    ///
    /// Engines that enforce the timeout themselves should report it as a
    /// [`KeyFetchError::TimedOut`](crate::KeyFetchError::TimedOut) so the
    /// registry can pass it through unchanged.
    async fn fetch_public_key(&self, node_id: NodeId, timeout: Duration) -> Result<PublicKey>;

    /// Consume a message addressed to this node.
    fn handle_message(&self, message: Message);

    /// Stop the engine, draining or failing every pending fetch.
    async fn stop(&self);
}
