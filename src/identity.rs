//! # Node Identities and Public Keys
//!
//! This module defines the identity types used throughout the launcher:
//!
//! - [`NodeId`]: 32-byte opaque identifier of an overlay peer
//! - [`PublicKey`]: validated Ed25519 verifying key of a peer
//! - [`Keypair`]: Ed25519 signing keypair (used to seed key records)
//!
//! ## Identity Model
//!
//! A peer's [`NodeId`] is the BLAKE3 digest of its public key. The overlay asks
//! for a peer's public key by `NodeId` whenever it must validate a message the
//! peer signed; the key registry resolves that request asynchronously.
//!
//! ## Invariants
//!
//! - `NodeId::from_bytes(bytes).as_bytes() == bytes`
//! - `NodeId` parses back from its `Display` form
//! - Only valid Ed25519 points are accepted as public keys

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Domain separation prefix for deriving node ids from public keys.
const NODE_ID_DOMAIN: &[u8] = b"overlay-launcher-node-id-v1:";

/// Rejected public key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid Ed25519 public key")]
pub struct InvalidPublicKey;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the node id owned by `key`.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(NODE_ID_DOMAIN);
        hasher.update(&key.to_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl FromStr for NodeId {
    type Err = hex::FromHexError;

    /// Parse the 64-character hex form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 bytes are plenty to tell peers apart in logs.
        write!(f, "NodeId({}..)", hex::encode(&self.0[..8]))
    }
}

/// A peer's Ed25519 public key, as handed back to the overlay.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, InvalidPublicKey> {
        if bytes.iter().all(|&b| b == 0) || bytes.iter().all(|&b| b == 0xFF) {
            return Err(InvalidPublicKey);
        }
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| InvalidPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(self)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify(message, signature).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    pub fn node_id(&self) -> NodeId {
        self.public_key().node_id()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypairs_are_distinct() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.node_id(), kp2.node_id());
        assert_ne!(kp1.public_key(), kp2.public_key());
    }

    #[test]
    fn node_id_is_stable_for_a_key() {
        let kp = Keypair::from_secret_key_bytes(&[7u8; 32]);
        assert_eq!(kp.node_id(), NodeId::from_public_key(&kp.public_key()));
        assert_eq!(kp.node_id(), kp.public_key().node_id());
    }

    #[test]
    fn public_key_round_trips_and_verifies() {
        let kp = Keypair::generate();
        let key = PublicKey::from_bytes(&kp.public_key().to_bytes()).unwrap();

        let signature = kp.sign(b"hello overlay");
        assert!(key.verify(b"hello overlay", &signature));
        assert!(!key.verify(b"tampered", &signature));
    }

    #[test]
    fn trivial_public_keys_are_rejected() {
        assert_eq!(PublicKey::from_bytes(&[0u8; 32]), Err(InvalidPublicKey));
        assert_eq!(PublicKey::from_bytes(&[0xFF; 32]), Err(InvalidPublicKey));
    }

    #[test]
    fn node_id_parses_from_display() {
        let id = Keypair::generate().node_id();
        assert_eq!(id.to_string().parse::<NodeId>().unwrap(), id);
        assert!("abcd".parse::<NodeId>().is_err());
        assert!("zz".repeat(32).parse::<NodeId>().is_err());
    }
}
