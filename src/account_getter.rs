//! # Account Getter
//!
//! Entry point of the crate. An [`AccountGetter`] is a client that has joined
//! the overlay and can resolve peers' public keys for it.
//!
//! ## Quick Start
//!
//! ```ignore
//! let backend = Backend::Live { overlay, engine };
//! let getter = AccountGetter::create(LauncherConfig::default(), backend).await?;
//! // ... use getter.engine() ...
//! getter.shutdown().await;
//! ```
//!
//! ## Construction
//!
//! [`AccountGetter::create`] never blocks its caller. Construction runs on its
//! own task: build the executor, key registry and dispatcher, register the
//! handler table with the overlay, join, and wait for the health score to
//! resolve. The returned [`PendingAccountGetter`] resolves with the finished
//! instance or with [`LauncherError::NotConnected`].
//!
//! ## Teardown
//!
//! Order matters because the overlay calls back into us while it is being
//! released:
//!
//! 1. detach the handler table (late callbacks become no-ops)
//! 2. stop the key/data engine
//! 3. answer any key requests still pending
//! 4. release the overlay
//! 5. drain and stop the executor
//!
//! [`AccountGetter::shutdown`] performs this explicitly. Dropping an instance
//! without calling it runs the same sequence on a background task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{LauncherConfig, LauncherMode};
use crate::dispatch::MessageDispatcher;
use crate::error::LauncherError;
use crate::executor::AsyncExecutor;
use crate::fake_store::FakeStore;
use crate::health::{HealthSnapshot, HealthState};
use crate::identity::NodeId;
use crate::join::{Attachment, JoinCoordinator, JoinState};
use crate::keys::KeyRequestRegistry;
use crate::protocols::{KeyDataEngine, Overlay};

/// Collaborators an account getter runs on.
pub enum Backend {
    /// Join `overlay` and resolve keys through `engine`.
    Live {
        overlay: Arc<dyn Overlay>,
        engine: Arc<dyn KeyDataEngine>,
    },
    /// No overlay; serve everything from an in-memory store.
    FakeStore(FakeStore),
}

impl Backend {
    pub fn mode(&self) -> LauncherMode {
        match self {
            Backend::Live { .. } => LauncherMode::Live,
            Backend::FakeStore(_) => LauncherMode::FakeStore,
        }
    }
}

/// Everything that only exists when joined to a live overlay.
struct LiveParts {
    overlay: Arc<dyn Overlay>,
    own_id: NodeId,
    health: HealthState,
    executor: AsyncExecutor,
    keys: KeyRequestRegistry,
    attachment: Attachment,
    join_state: JoinState,
}

pub struct AccountGetter {
    mode: LauncherMode,
    engine: Arc<dyn KeyDataEngine>,
    /// `None` in fake-store mode, and after teardown has started.
    live: Option<LiveParts>,
}

/// Future returned by [`AccountGetter::create`].
pub struct PendingAccountGetter {
    handle: JoinHandle<Result<AccountGetter, LauncherError>>,
}

impl Future for PendingAccountGetter {
    type Output = Result<AccountGetter, LauncherError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => {
                Poll::Ready(Err(LauncherError::ConstructionAborted(e.to_string())))
            }
        }
    }
}

impl AccountGetter {
    /// Start building an account getter on a background task.
    ///
    /// Must be called from within a tokio runtime. Nothing observable happens
    /// on the calling task.
    pub fn create(config: LauncherConfig, backend: Backend) -> PendingAccountGetter {
        PendingAccountGetter {
            handle: tokio::spawn(Self::construct(config, backend)),
        }
    }

    async fn construct(config: LauncherConfig, backend: Backend) -> Result<Self, LauncherError> {
        config.validate()?;

        let (overlay, engine) = match backend {
            Backend::FakeStore(store) => {
                info!("using in-memory fake store; overlay join skipped");
                return Ok(Self {
                    mode: LauncherMode::FakeStore,
                    engine: Arc::new(store),
                    live: None,
                });
            }
            Backend::Live { overlay, engine } => (overlay, engine),
        };

        let executor = AsyncExecutor::spawn(config.executor_workers);
        let keys = KeyRequestRegistry::new(
            engine.clone(),
            executor.clone(),
            config.key_fetch_timeout,
            config.max_pending_key_requests,
        );
        let dispatcher = Arc::new(MessageDispatcher::new(engine.clone(), keys.clone()));
        let health = HealthState::new();
        let attachment = Attachment::new();

        let mut coordinator = JoinCoordinator::new(
            overlay.clone(),
            dispatcher,
            health.clone(),
            executor.clone(),
            attachment.clone(),
            config.join_timeout,
        );

        match coordinator.join().await {
            Ok(own_id) => Ok(Self {
                mode: LauncherMode::Live,
                engine,
                live: Some(LiveParts {
                    overlay,
                    own_id,
                    health,
                    executor,
                    keys,
                    attachment,
                    join_state: coordinator.state(),
                }),
            }),
            Err(e) => {
                // Nothing else holds these parts; tear them down in order
                // before reporting the failure.
                let own_id = coordinator
                    .own_identity()
                    .unwrap_or_else(|| overlay.own_identity());
                let parts = LiveParts {
                    overlay,
                    own_id,
                    health,
                    executor,
                    keys,
                    attachment,
                    join_state: coordinator.state(),
                };
                teardown(engine, parts).await;
                Err(e)
            }
        }
    }

    pub fn mode(&self) -> LauncherMode {
        self.mode
    }

    /// This node's overlay identity, captured before joining.
    pub fn own_identity(&self) -> Option<NodeId> {
        self.live.as_ref().map(|live| live.own_id)
    }

    /// Latest network health score reported by the overlay.
    pub fn health(&self) -> Option<i32> {
        self.live.as_ref().map(|live| live.health.current())
    }

    /// Score, resolution and number of updates applied so far.
    pub fn health_snapshot(&self) -> Option<HealthSnapshot> {
        self.live.as_ref().map(|live| live.health.snapshot())
    }

    /// Fake-store instances never join and report `Connected`.
    pub fn join_state(&self) -> JoinState {
        self.live
            .as_ref()
            .map_or(JoinState::Connected, |live| live.join_state)
    }

    pub fn engine(&self) -> &Arc<dyn KeyDataEngine> {
        &self.engine
    }

    pub fn pending_key_requests(&self) -> usize {
        self.live.as_ref().map_or(0, |live| live.keys.pending_count())
    }

    /// Tear down in order: detach, stop engine, fail pending key requests,
    /// release overlay, stop executor.
    pub async fn shutdown(mut self) {
        match self.live.take() {
            Some(parts) => teardown(self.engine.clone(), parts).await,
            None => self.engine.stop().await,
        }
    }
}

impl Drop for AccountGetter {
    fn drop(&mut self) {
        let Some(parts) = self.live.take() else {
            return;
        };
        // Detach synchronously so nothing the overlay does from here on can
        // reach our state, then finish the ordered teardown off-thread.
        parts.attachment.detach();

        let engine = self.engine.clone();
        match Handle::try_current() {
            Ok(runtime) => {
                debug!("account getter dropped without shutdown; tearing down in background");
                runtime.spawn(teardown(engine, parts));
            }
            Err(_) => {
                warn!("account getter dropped outside a runtime; engine not stopped");
                parts.keys.cancel_all();
                parts.overlay.leave();
            }
        }
    }
}

async fn teardown(engine: Arc<dyn KeyDataEngine>, parts: LiveParts) {
    let LiveParts {
        overlay,
        own_id,
        executor,
        keys,
        attachment,
        ..
    } = parts;

    attachment.detach();
    engine.stop().await;
    keys.cancel_all();
    overlay.leave();
    executor.shutdown().await;
    debug!(node = ?own_id, "account getter shut down");
}
