//! Integration tests for the AccountGetter public API.
//!
//! Each test drives a [`SimulatedOverlay`] the way a real overlay behaves:
//! callbacks arrive on overlay-owned threads, health is reported as a
//! sequence of scores, and `leave` fires one last status report.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use overlay_launcher::{
    AccountGetter, Backend, CloseNodesChange, FakeStore, GroupToSingleMessage, JoinState,
    KeyDataEngine, KeyFetchError, Keypair, LauncherConfig, LauncherError, LauncherMode, Message,
    NodeId, Overlay, OverlayEvent, OverlayHandlers, PublicKey, SimulatedOverlay,
    SingleToGroupMessage, SingleToSingleMessage, TEARDOWN_HEALTH,
};
use tokio::time::timeout;

/// Upper bound on any single await in these tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const STEP: Duration = Duration::from_millis(5);

fn simulated(script: Vec<i32>) -> Arc<SimulatedOverlay> {
    Arc::new(
        SimulatedOverlay::new(Keypair::generate().node_id()).with_health_script(script, STEP),
    )
}

fn live(overlay: Arc<SimulatedOverlay>, store: &FakeStore) -> Backend {
    Backend::Live {
        overlay,
        engine: Arc::new(store.clone()),
    }
}

async fn connect(
    config: LauncherConfig,
    overlay: Arc<SimulatedOverlay>,
    store: &FakeStore,
) -> AccountGetter {
    timeout(TEST_TIMEOUT, AccountGetter::create(config, live(overlay, store)))
        .await
        .expect("construction timed out")
        .expect("construction failed")
}

#[tokio::test]
async fn connects_after_health_reaches_threshold() {
    let overlay = simulated(vec![50, 100]);
    let store = FakeStore::new();

    let getter = connect(LauncherConfig::default(), overlay.clone(), &store).await;

    assert_eq!(getter.mode(), LauncherMode::Live);
    assert_eq!(getter.join_state(), JoinState::Connected);
    assert_eq!(getter.health(), Some(100));
    assert_eq!(getter.own_identity(), Some(overlay.own_identity()));
    assert_eq!(overlay.join_count(), 1);

    getter.shutdown().await;
}

#[tokio::test]
async fn severe_failure_fails_construction() {
    let overlay = simulated(vec![0, -400_000]);
    let store = FakeStore::new();

    let result = timeout(
        TEST_TIMEOUT,
        AccountGetter::create(LauncherConfig::default(), live(overlay.clone(), &store)),
    )
    .await
    .expect("construction timed out");

    match result {
        Err(LauncherError::NotConnected { health }) => assert_eq!(health, -400_000),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("construction should fail"),
    }
    assert!(overlay.has_left(), "overlay should be released after a failed join");
}

#[tokio::test]
async fn join_timeout_is_reported() {
    let overlay = simulated(vec![10, 20]);
    let store = FakeStore::new();
    let config = LauncherConfig {
        join_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };

    let pending = AccountGetter::create(config, live(overlay.clone(), &store));
    let result = timeout(TEST_TIMEOUT, pending)
        .await
        .expect("construction timed out");

    assert!(matches!(result, Err(LauncherError::JoinTimedOut(_))));
    assert!(overlay.has_left());
}

#[tokio::test]
async fn concurrent_key_requests_resolve_out_of_order() {
    let overlay = simulated(vec![100]);
    let store = FakeStore::new();
    let getter = connect(LauncherConfig::default(), overlay.clone(), &store).await;

    let a = Keypair::generate();
    let b = Keypair::generate();
    let reply_a = overlay.request_public_key(a.node_id());
    let reply_b = overlay.request_public_key(b.node_id());
    assert_eq!(getter.pending_key_requests(), 2);

    // B becomes available first; its reply must not wait for A.
    store.put_public_key(&b.public_key()).unwrap();
    let got_b = timeout(TEST_TIMEOUT, reply_b).await.unwrap().unwrap();
    assert_eq!(got_b, Ok(b.public_key()));
    assert_eq!(getter.pending_key_requests(), 1);

    store.put_public_key(&a.public_key()).unwrap();
    let got_a = timeout(TEST_TIMEOUT, reply_a).await.unwrap().unwrap();
    assert_eq!(got_a, Ok(a.public_key()));

    wait_for(|| getter.pending_key_requests() == 0).await;
    getter.shutdown().await;
}

#[tokio::test]
async fn unresolvable_key_times_out() {
    let overlay = simulated(vec![100]);
    let store = FakeStore::new();
    let key_timeout = Duration::from_millis(50);
    let config = LauncherConfig {
        key_fetch_timeout: key_timeout,
        ..Default::default()
    };
    let getter = connect(config, overlay.clone(), &store).await;

    let missing = Keypair::generate().node_id();
    let outcome = timeout(TEST_TIMEOUT, overlay.request_public_key(missing))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        outcome,
        Err(KeyFetchError::TimedOut {
            node_id: missing,
            timeout: key_timeout
        })
    );
    getter.shutdown().await;
}

#[tokio::test]
async fn key_requests_are_bounded() {
    let overlay = simulated(vec![100]);
    let store = FakeStore::new();
    let config = LauncherConfig {
        max_pending_key_requests: 2,
        ..Default::default()
    };
    let getter = connect(config, overlay.clone(), &store).await;

    let _first = overlay.request_public_key(Keypair::generate().node_id());
    let _second = overlay.request_public_key(Keypair::generate().node_id());
    let third = overlay.request_public_key(Keypair::generate().node_id());

    let outcome = timeout(TEST_TIMEOUT, third).await.unwrap().unwrap();
    assert_eq!(outcome, Err(KeyFetchError::Overloaded { limit: 2 }));
    assert_eq!(getter.pending_key_requests(), 2);

    getter.shutdown().await;
}

#[tokio::test]
async fn only_point_to_single_messages_reach_the_engine() {
    let overlay = simulated(vec![100]);
    let store = FakeStore::new();
    let getter = connect(LauncherConfig::default(), overlay.clone(), &store).await;

    let sender = Keypair::generate().node_id();
    let receiver = overlay.own_identity();

    overlay.deliver(OverlayEvent::MessageReceived(Message::SingleToGroup(
        SingleToGroupMessage {
            sender,
            receiver,
            contents: b"to the group".to_vec(),
            cacheable: false,
        },
    )));
    assert!(store.handled_messages().is_empty());

    overlay.deliver(OverlayEvent::MessageReceived(Message::SingleToSingle(
        SingleToSingleMessage {
            sender,
            receiver,
            contents: b"direct".to_vec(),
            cacheable: false,
        },
    )));
    overlay.deliver(OverlayEvent::MessageReceived(Message::GroupToSingle(
        GroupToSingleMessage {
            sender_group: Keypair::generate().node_id(),
            sender,
            receiver,
            contents: b"from the group".to_vec(),
            cacheable: true,
        },
    )));
    overlay.close_nodes_changed(CloseNodesChange::default());

    let handled: Vec<Vec<u8>> = store
        .handled_messages()
        .iter()
        .map(|m| m.contents().to_vec())
        .collect();
    assert_eq!(handled, vec![b"direct".to_vec(), b"from the group".to_vec()]);
    assert_eq!(getter.health(), Some(100));

    getter.shutdown().await;
}

#[tokio::test]
async fn fake_store_mode_resolves_keys_without_overlay() {
    let store = FakeStore::new();
    let peer = Keypair::generate();
    store.put_public_key(&peer.public_key()).unwrap();

    let getter = timeout(
        TEST_TIMEOUT,
        AccountGetter::create(LauncherConfig::default(), Backend::FakeStore(store.clone())),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(getter.mode(), LauncherMode::FakeStore);
    assert_eq!(getter.own_identity(), None);
    assert_eq!(getter.join_state(), JoinState::Connected);

    let key = getter
        .engine()
        .fetch_public_key(peer.node_id(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(key, peer.public_key());

    getter.shutdown().await;
    assert!(store.is_stopped());
}

/// Records the order in which collaborators are torn down, and whether the
/// final network-status callback from `leave` changes anything.
struct TracingOverlay {
    inner: SimulatedOverlay,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Overlay for TracingOverlay {
    fn own_identity(&self) -> NodeId {
        self.inner.own_identity()
    }

    fn join(&self, handlers: Arc<dyn OverlayHandlers>) {
        self.inner.join(handlers);
    }

    fn leave(&self) {
        self.log.lock().unwrap().push("overlay.leave");
        self.inner.leave();
    }
}

struct TracingEngine {
    inner: FakeStore,
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl KeyDataEngine for TracingEngine {
    async fn fetch_public_key(
        &self,
        node_id: NodeId,
        timeout: Duration,
    ) -> anyhow::Result<PublicKey> {
        self.inner.fetch_public_key(node_id, timeout).await
    }

    fn handle_message(&self, message: Message) {
        self.inner.handle_message(message);
    }

    async fn stop(&self) {
        self.log.lock().unwrap().push("engine.stop");
        self.inner.stop().await;
    }
}

#[tokio::test]
async fn shutdown_stops_engine_before_releasing_overlay() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let overlay = Arc::new(TracingOverlay {
        inner: SimulatedOverlay::new(Keypair::generate().node_id())
            .with_health_script(vec![100], STEP),
        log: log.clone(),
    });
    let engine = Arc::new(TracingEngine {
        inner: FakeStore::new(),
        log: log.clone(),
    });

    let getter = timeout(
        TEST_TIMEOUT,
        AccountGetter::create(
            LauncherConfig::default(),
            Backend::Live {
                overlay: overlay.clone(),
                engine,
            },
        ),
    )
    .await
    .unwrap()
    .unwrap();

    getter.shutdown().await;

    assert_eq!(*log.lock().unwrap(), vec!["engine.stop", "overlay.leave"]);
    assert!(overlay.inner.has_left());
}

#[tokio::test]
async fn late_callbacks_after_shutdown_are_harmless() {
    let overlay = simulated(vec![100]);
    let store = FakeStore::new();
    let getter = connect(LauncherConfig::default(), overlay.clone(), &store).await;

    let pending = overlay.request_public_key(Keypair::generate().node_id());
    getter.shutdown().await;

    // `leave` reported TEARDOWN_HEALTH while shutting down; the reply
    // contract still held for the request that was in flight.
    assert!(overlay.has_left());
    let outcome = timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(outcome.is_err());

    // Late callbacks after teardown are harmless.
    overlay.report_health(TEARDOWN_HEALTH);
    let late_request = overlay.request_public_key(Keypair::generate().node_id());
    let late = timeout(TEST_TIMEOUT, late_request).await;
    assert!(late.unwrap().is_err(), "no handlers remain, reply sender is dropped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn health_updates_apply_in_report_order() {
    let overlay = simulated(vec![100]);
    let store = FakeStore::new();
    let config = LauncherConfig {
        executor_workers: 4,
        ..Default::default()
    };
    let getter = connect(config, overlay.clone(), &store).await;
    let baseline = getter.health_snapshot().unwrap().updates;

    // Key completions spread over every lane while the reports arrive.
    let scores = [90, 80, 70, 60, 50, 40, 30, 20, 10, 5];
    let mut replies = Vec::new();
    for score in scores {
        let peer = Keypair::generate();
        store.put_public_key(&peer.public_key()).unwrap();
        replies.push((overlay.request_public_key(peer.node_id()), peer.public_key()));
        overlay.report_health(score);
    }

    let expected = baseline + scores.len() as u64;
    wait_for(|| getter.health_snapshot().unwrap().updates == expected).await;
    assert_eq!(getter.health(), Some(5));

    for (reply, key) in replies {
        let outcome = timeout(TEST_TIMEOUT, reply).await.unwrap().unwrap();
        assert_eq!(outcome, Ok(key));
    }
    assert_eq!(getter.health(), Some(5));

    getter.shutdown().await;
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
