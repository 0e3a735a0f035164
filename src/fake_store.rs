//! In-memory key/data engine.
//!
//! Backs the [`LauncherMode::FakeStore`](crate::LauncherMode::FakeStore) mode
//! and stands in for the real engine in tests and the simulated overlay.
//! Key records are held bincode-encoded, exactly as a real store would hand
//! them back, and decoded with size bounds on every fetch.
//!
//! A fetch for a key that has not been stored yet waits for it: it resolves
//! as soon as the key is put, fails once the store is stopped, and reports
//! [`KeyFetchError::TimedOut`] when the caller's timeout elapses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identity::{NodeId, PublicKey};
use crate::keys::KeyFetchError;
use crate::messages::{Message, PublicKeyRecord, deserialize_bounded, serialize_bounded};
use crate::protocols::KeyDataEngine;

#[derive(Clone, Default)]
pub struct FakeStore {
    inner: Arc<FakeStoreInner>,
}

#[derive(Default)]
struct FakeStoreInner {
    records: Mutex<Records>,
    /// Optional bound on stored bytes; puts past it are rejected.
    max_bytes: Option<usize>,
    stored: Notify,
    stopped: AtomicBool,
    messages: Mutex<Vec<Message>>,
}

#[derive(Default)]
struct Records {
    by_id: HashMap<NodeId, Vec<u8>>,
    used_bytes: usize,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses to hold more than `max_bytes` of records.
    pub fn with_capacity(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(FakeStoreInner {
                max_bytes: Some(max_bytes),
                ..Default::default()
            }),
        }
    }

    pub fn put_public_key(&self, key: &PublicKey) -> Result<()> {
        let record = PublicKeyRecord::new(key);
        let bytes = serialize_bounded(&record).context("failed to encode public key record")?;
        self.put_checked(record.node_id, bytes)
    }

    /// Store raw record bytes without validation.
    pub fn put_record_bytes(&self, node_id: NodeId, bytes: Vec<u8>) {
        let mut records = self.lock_records();
        records.insert(node_id, bytes);
        drop(records);
        self.inner.stored.notify_waiters();
    }

    fn put_checked(&self, node_id: NodeId, bytes: Vec<u8>) -> Result<()> {
        if self.is_stopped() {
            bail!("fake store is stopped");
        }
        let mut records = self.lock_records();
        if let Some(max) = self.inner.max_bytes {
            let replaced = records.by_id.get(&node_id).map_or(0, Vec::len);
            let after = records.used_bytes - replaced + bytes.len();
            if after > max {
                bail!("fake store full ({} of {} bytes used)", records.used_bytes, max);
            }
        }
        records.insert(node_id, bytes);
        drop(records);

        trace!(node = ?node_id, "public key stored");
        self.inner.stored.notify_waiters();
        Ok(())
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.lock_records().by_id.contains_key(node_id)
    }

    pub fn used_bytes(&self) -> usize {
        self.lock_records().used_bytes
    }

    /// Messages delivered through [`KeyDataEngine::handle_message`], in order.
    pub fn handled_messages(&self) -> Vec<Message> {
        self.inner
            .messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, Records> {
        self.inner.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, node_id: &NodeId) -> Option<Result<PublicKey>> {
        let bytes = self.lock_records().by_id.get(node_id).cloned()?;
        Some(decode_record(node_id, &bytes))
    }
}

impl Records {
    fn insert(&mut self, node_id: NodeId, bytes: Vec<u8>) {
        let len = bytes.len();
        if let Some(old) = self.by_id.insert(node_id, bytes) {
            self.used_bytes -= old.len();
        }
        self.used_bytes += len;
    }
}

fn decode_record(node_id: &NodeId, bytes: &[u8]) -> Result<PublicKey> {
    let record: PublicKeyRecord =
        deserialize_bounded(bytes).context("corrupt public key record")?;
    if record.node_id != *node_id {
        bail!("record for {} stored under {}", record.node_id, node_id);
    }
    record
        .public_key()
        .map_err(|e| anyhow!("stored key for {} is unusable: {}", node_id, e))
}

#[async_trait]
impl KeyDataEngine for FakeStore {
    async fn fetch_public_key(&self, node_id: NodeId, timeout: Duration) -> Result<PublicKey> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before looking, so a put racing with the
            // lookup still wakes us.
            let stored = self.inner.stored.notified();

            if self.is_stopped() {
                bail!("fake store is stopped");
            }
            if let Some(found) = self.lookup(&node_id) {
                return found;
            }
            if tokio::time::timeout_at(deadline, stored).await.is_err() {
                return Err(KeyFetchError::TimedOut { node_id, timeout }.into());
            }
        }
    }

    fn handle_message(&self, message: Message) {
        debug!(
            category = %message.category(),
            sender = ?message.sender(),
            "fake store handled message"
        );
        self.inner
            .messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    async fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            debug!("fake store stopped");
        }
        self.inner.stored.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::messages::SingleToSingleMessage;

    #[tokio::test]
    async fn stored_key_is_fetched() {
        let store = FakeStore::new();
        let kp = Keypair::generate();
        store.put_public_key(&kp.public_key()).unwrap();

        let key = store
            .fetch_public_key(kp.node_id(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(key, kp.public_key());
        assert!(store.contains(&kp.node_id()));
    }

    #[tokio::test]
    async fn fetch_waits_for_late_put() {
        let store = FakeStore::new();
        let kp = Keypair::generate();

        let fetch = {
            let store = store.clone();
            let node_id = kp.node_id();
            tokio::spawn(async move {
                store
                    .fetch_public_key(node_id, Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        store.put_public_key(&kp.public_key()).unwrap();

        assert_eq!(fetch.await.unwrap().unwrap(), kp.public_key());
    }

    #[tokio::test]
    async fn missing_key_times_out_with_typed_error() {
        let store = FakeStore::new();
        let node_id = Keypair::generate().node_id();
        let timeout = Duration::from_millis(20);

        let err = store.fetch_public_key(node_id, timeout).await.unwrap_err();
        assert_eq!(
            err.downcast::<KeyFetchError>().unwrap(),
            KeyFetchError::TimedOut { node_id, timeout }
        );
    }

    #[tokio::test]
    async fn stop_fails_waiting_fetches() {
        let store = FakeStore::new();
        let node_id = Keypair::generate().node_id();

        let fetch = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .fetch_public_key(node_id, Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        store.stop().await;

        assert!(fetch.await.unwrap().is_err());
        assert!(store.is_stopped());
        assert!(store.put_public_key(&Keypair::generate().public_key()).is_err());
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error() {
        let store = FakeStore::new();
        let node_id = Keypair::generate().node_id();
        store.put_record_bytes(node_id, vec![1, 2, 3]);

        assert!(store.fetch_public_key(node_id, Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn capacity_is_enforced() {
        let one_record = serialize_bounded(&PublicKeyRecord::new(&Keypair::generate().public_key()))
            .unwrap()
            .len();
        let store = FakeStore::with_capacity(one_record);

        let first = Keypair::generate();
        store.put_public_key(&first.public_key()).unwrap();
        assert!(store.put_public_key(&Keypair::generate().public_key()).is_err());
        // Overwriting the same record does not grow usage.
        store.put_public_key(&first.public_key()).unwrap();
        assert_eq!(store.used_bytes(), one_record);
    }

    #[test]
    fn handled_messages_are_recorded_in_order() {
        let store = FakeStore::new();
        for i in 0..3u8 {
            store.handle_message(Message::SingleToSingle(SingleToSingleMessage {
                sender: NodeId::from_bytes([i; 32]),
                receiver: NodeId::from_bytes([9; 32]),
                contents: vec![i],
                cacheable: false,
            }));
        }
        let contents: Vec<_> = store
            .handled_messages()
            .iter()
            .map(|m| m.contents().to_vec())
            .collect();
        assert_eq!(contents, vec![vec![0], vec![1], vec![2]]);
    }
}
