//! Routing of overlay events.
//!
//! | Category | Action |
//! |----------|--------|
//! | group → single, received | engine `handle_message` |
//! | single → single, received | engine `handle_message` (cached responses) |
//! | single → group, received | none |
//! | group → group, received | none |
//! | single → group relay, received | none |
//! | any cache population | none |
//! | request public key | [`KeyRequestRegistry::request_key`] |
//!
//! The overlay insists on a handler for every category, so the no-ops are
//! spelled out rather than falling through a wildcard arm.

use std::sync::Arc;

use tracing::trace;

use crate::keys::KeyRequestRegistry;
use crate::messages::{CacheableMessage, Message, OverlayEvent};
use crate::protocols::KeyDataEngine;

pub struct MessageDispatcher {
    engine: Arc<dyn KeyDataEngine>,
    keys: KeyRequestRegistry,
}

impl MessageDispatcher {
    pub fn new(engine: Arc<dyn KeyDataEngine>, keys: KeyRequestRegistry) -> Self {
        Self { engine, keys }
    }

    pub fn dispatch(&self, event: OverlayEvent) {
        match event {
            OverlayEvent::MessageReceived(message) => self.message_received(message),
            OverlayEvent::PutCacheData(message) => self.put_cache_data(message),
            OverlayEvent::RequestPublicKey { node_id, reply } => {
                self.keys.request_key(node_id, reply);
            }
        }
    }

    fn message_received(&self, message: Message) {
        match message {
            Message::GroupToSingle(_) | Message::SingleToSingle(_) => {
                self.engine.handle_message(message);
            }
            Message::SingleToGroup(_) => {}
            Message::GroupToGroup(_) => {}
            Message::SingleToGroupRelay(_) => {}
        }
    }

    fn put_cache_data(&self, message: CacheableMessage) {
        trace!(category = %message.category(), "ignoring cache population");
        match message {
            CacheableMessage::SingleToGroup(_) => {}
            CacheableMessage::GroupToSingle(_) => {}
            CacheableMessage::GroupToGroup(_) => {}
        }
    }
}
