//! # Overlay Launcher - Joined Overlay Clients
//!
//! Builds a client that has joined a routing overlay, waits for the overlay
//! to report itself healthy, and then serves the overlay's callbacks:
//!
//! - **Join gating**: the overlay reports a health score; construction
//!   succeeds at `>= 100` and fails below `-300000`
//! - **Message dispatch**: every overlay event category has an explicit handler
//! - **Public key requests**: asynchronous, concurrent, answered exactly once
//! - **Teardown**: the overlay is released only after our own state is safe
//!
//! ## Architecture
//!
//! The overlay calls back on its own threads. Callbacks never block and never
//! touch launcher state directly:
//! - Health updates are posted to a serial lane of the [`AsyncExecutor`]
//! - Key requests start an engine fetch on the tokio runtime and hand the
//!   reply back through the executor when it completes
//! - An [`Attachment`] flag turns every callback into a no-op once teardown
//!   has begun
//!
//! ## Backends
//!
//! | Backend | Join | Keys |
//! |---------|------|------|
//! | [`Backend::Live`] | real overlay | caller-supplied [`KeyDataEngine`] |
//! | [`Backend::FakeStore`] | skipped | in-memory [`FakeStore`] |
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `account_getter` | Async factory, accessors, ordered teardown |
//! | `join` | Join state machine and the overlay handler table |
//! | `health` | Health score tracking and resolution thresholds |
//! | `dispatch` | Exhaustive routing of overlay events |
//! | `keys` | Pending public key requests keyed by request id |
//! | `executor` | Callback executor with a serial lane |
//! | `protocols` | Overlay and engine trait definitions |
//! | `messages` | Overlay message shapes and key records |
//! | `identity` | Node ids and Ed25519 keys |
//! | `fake_store` | In-memory key/data engine |
//! | `sim` | In-process overlay for local runs and tests |
//! | `config` | Launcher configuration |
//! | `error` | Launcher errors |

mod account_getter;
mod config;
mod dispatch;
mod error;
mod executor;
mod fake_store;
mod health;
mod identity;
mod join;
mod keys;
mod messages;
mod protocols;
mod sim;

pub use account_getter::{AccountGetter, Backend, PendingAccountGetter};
pub use config::{
    DEFAULT_EXECUTOR_WORKERS, DEFAULT_KEY_FETCH_TIMEOUT, DEFAULT_MAX_PENDING_KEY_REQUESTS,
    LauncherConfig, LauncherMode,
};
pub use dispatch::MessageDispatcher;
pub use error::LauncherError;
pub use executor::{AsyncExecutor, ExecutorClosed, Task};
pub use fake_store::FakeStore;
pub use health::{
    CONNECTED_THRESHOLD, HealthResolution, HealthSnapshot, HealthState, INITIAL_HEALTH,
    SEVERE_FAILURE_THRESHOLD,
};
pub use identity::{InvalidPublicKey, Keypair, NodeId, PublicKey};
pub use join::{Attachment, HandlerTable, JoinCoordinator, JoinState};
pub use keys::{GivePublicKey, KeyFetchError, KeyRequestRegistry};
pub use messages::{
    CacheableMessage, CloseNodesChange, GroupToGroupMessage, GroupToSingleMessage,
    MAX_DESERIALIZE_SIZE, Message, MessageCategory, OverlayEvent, PublicKeyRecord,
    SingleToGroupMessage, SingleToGroupRelayMessage, SingleToSingleMessage,
};
pub use protocols::{KeyDataEngine, Overlay, OverlayHandlers};
pub use sim::{SimulatedOverlay, TEARDOWN_HEALTH};
