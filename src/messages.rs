//! # Overlay Message Model
//!
//! This module defines every shape the overlay can deliver to the launcher and
//! the stored form of a peer's public key.
//!
//! ## Delivery Shapes
//!
//! | Shape | Message received | Cache population |
//! |-------|------------------|------------------|
//! | single → single | [`Message::SingleToSingle`] | n/a |
//! | single → group | [`Message::SingleToGroup`] | [`CacheableMessage::SingleToGroup`] |
//! | group → single | [`Message::GroupToSingle`] | [`CacheableMessage::GroupToSingle`] |
//! | group → group | [`Message::GroupToGroup`] | [`CacheableMessage::GroupToGroup`] |
//! | single → group relay | [`Message::SingleToGroupRelay`] | n/a |
//!
//! Together with the public-key request these form the closed set of
//! [`MessageCategory`] values. Adding a shape adds a variant here, and every
//! `match` over [`OverlayEvent`] stops compiling until it is handled.
//!
//! ## Key Records
//!
//! [`PublicKeyRecord`] is encoded with bincode. Decoding goes through
//! [`deserialize_bounded`] so a corrupt record cannot request an unbounded
//! allocation.

use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{InvalidPublicKey, NodeId, PublicKey};
use crate::keys::GivePublicKey;

/// Maximum buffer size for deserialization of stored records.
pub const MAX_DESERIALIZE_SIZE: u64 = 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Delivery Shapes
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleToSingleMessage {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub contents: Vec<u8>,
    pub cacheable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleToGroupMessage {
    pub sender: NodeId,
    /// Group address (the id the group is centred on).
    pub receiver: NodeId,
    pub contents: Vec<u8>,
    pub cacheable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupToSingleMessage {
    /// Group the message was sent on behalf of.
    pub sender_group: NodeId,
    /// Group member that actually sent it.
    pub sender: NodeId,
    pub receiver: NodeId,
    pub contents: Vec<u8>,
    pub cacheable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupToGroupMessage {
    pub sender_group: NodeId,
    pub sender: NodeId,
    pub receiver: NodeId,
    pub contents: Vec<u8>,
    pub cacheable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleToGroupRelayMessage {
    pub sender: NodeId,
    /// Node relaying on behalf of a sender that has not joined yet.
    pub relay: NodeId,
    pub receiver: NodeId,
    pub contents: Vec<u8>,
    pub cacheable: bool,
}

/// A message delivered by the overlay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    SingleToSingle(SingleToSingleMessage),
    SingleToGroup(SingleToGroupMessage),
    GroupToSingle(GroupToSingleMessage),
    GroupToGroup(GroupToGroupMessage),
    SingleToGroupRelay(SingleToGroupRelayMessage),
}

impl Message {
    pub fn contents(&self) -> &[u8] {
        match self {
            Message::SingleToSingle(m) => &m.contents,
            Message::SingleToGroup(m) => &m.contents,
            Message::GroupToSingle(m) => &m.contents,
            Message::GroupToGroup(m) => &m.contents,
            Message::SingleToGroupRelay(m) => &m.contents,
        }
    }

    pub fn sender(&self) -> NodeId {
        match self {
            Message::SingleToSingle(m) => m.sender,
            Message::SingleToGroup(m) => m.sender,
            Message::GroupToSingle(m) => m.sender,
            Message::GroupToGroup(m) => m.sender,
            Message::SingleToGroupRelay(m) => m.sender,
        }
    }

    pub fn category(&self) -> MessageCategory {
        match self {
            Message::SingleToSingle(_) => MessageCategory::SingleToSingle,
            Message::SingleToGroup(_) => MessageCategory::SingleToGroup,
            Message::GroupToSingle(_) => MessageCategory::GroupToSingle,
            Message::GroupToGroup(_) => MessageCategory::GroupToGroup,
            Message::SingleToGroupRelay(_) => MessageCategory::SingleToGroupRelay,
        }
    }
}

/// A message the overlay offers for caching on this node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheableMessage {
    SingleToGroup(SingleToGroupMessage),
    GroupToSingle(GroupToSingleMessage),
    GroupToGroup(GroupToGroupMessage),
}

impl CacheableMessage {
    pub fn category(&self) -> MessageCategory {
        match self {
            CacheableMessage::SingleToGroup(_) => MessageCategory::CacheSingleToGroup,
            CacheableMessage::GroupToSingle(_) => MessageCategory::CacheGroupToSingle,
            CacheableMessage::GroupToGroup(_) => MessageCategory::CacheGroupToGroup,
        }
    }
}

/// Change in the set of nodes closest to this one. The launcher ignores it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseNodesChange {
    pub old_close_nodes: Vec<NodeId>,
    pub new_close_nodes: Vec<NodeId>,
}

/// Everything the overlay hands to the dispatcher.
pub enum OverlayEvent {
    MessageReceived(Message),
    PutCacheData(CacheableMessage),
    /// The overlay needs `node_id`'s public key; `reply` must be called once.
    RequestPublicKey { node_id: NodeId, reply: GivePublicKey },
}

impl OverlayEvent {
    pub fn category(&self) -> MessageCategory {
        match self {
            OverlayEvent::MessageReceived(message) => message.category(),
            OverlayEvent::PutCacheData(message) => message.category(),
            OverlayEvent::RequestPublicKey { .. } => MessageCategory::RequestPublicKey,
        }
    }
}

impl fmt::Debug for OverlayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayEvent::MessageReceived(m) => f.debug_tuple("MessageReceived").field(m).finish(),
            OverlayEvent::PutCacheData(m) => f.debug_tuple("PutCacheData").field(m).finish(),
            OverlayEvent::RequestPublicKey { node_id, .. } => f
                .debug_struct("RequestPublicKey")
                .field("node_id", node_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Flat enumeration of every dispatchable category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    SingleToSingle,
    SingleToGroup,
    GroupToSingle,
    GroupToGroup,
    SingleToGroupRelay,
    CacheSingleToGroup,
    CacheGroupToSingle,
    CacheGroupToGroup,
    RequestPublicKey,
}

impl MessageCategory {
    pub const ALL: [MessageCategory; 9] = [
        MessageCategory::SingleToSingle,
        MessageCategory::SingleToGroup,
        MessageCategory::GroupToSingle,
        MessageCategory::GroupToGroup,
        MessageCategory::SingleToGroupRelay,
        MessageCategory::CacheSingleToGroup,
        MessageCategory::CacheGroupToSingle,
        MessageCategory::CacheGroupToGroup,
        MessageCategory::RequestPublicKey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageCategory::SingleToSingle => "single_to_single",
            MessageCategory::SingleToGroup => "single_to_group",
            MessageCategory::GroupToSingle => "group_to_single",
            MessageCategory::GroupToGroup => "group_to_group",
            MessageCategory::SingleToGroupRelay => "single_to_group_relay",
            MessageCategory::CacheSingleToGroup => "cache_single_to_group",
            MessageCategory::CacheGroupToSingle => "cache_group_to_single",
            MessageCategory::CacheGroupToGroup => "cache_group_to_group",
            MessageCategory::RequestPublicKey => "request_public_key",
        }
    }
}

impl fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Key Records
// ============================================================================

/// Stored form of a peer's public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyRecord {
    pub node_id: NodeId,
    pub public_key: [u8; 32],
}

impl PublicKeyRecord {
    pub fn new(key: &PublicKey) -> Self {
        Self {
            node_id: key.node_id(),
            public_key: key.to_bytes(),
        }
    }

    /// Validate the record and return its key.
    ///
    /// Fails if the bytes are not a valid point or do not hash to `node_id`.
    pub fn public_key(&self) -> Result<PublicKey, InvalidPublicKey> {
        let key = PublicKey::from_bytes(&self.public_key)?;
        if key.node_id() != self.node_id {
            return Err(InvalidPublicKey);
        }
        Ok(key)
    }
}
