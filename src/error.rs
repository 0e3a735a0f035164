//! Failures surfaced to callers of the account-getter factory.
//!
//! Key-fetch failures are scoped to a single request and live in
//! [`KeyFetchError`](crate::KeyFetchError); nothing here is raised from an
//! overlay callback.

use std::time::Duration;

use crate::join::JoinState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LauncherError {
    /// The overlay reported a health score below the severe-failure threshold.
    #[error("not connected to the overlay (network health {health})")]
    NotConnected { health: i32 },

    /// The configured join bound elapsed before health resolved.
    #[error("overlay join did not resolve within {0:?}")]
    JoinTimedOut(Duration),

    /// A join step was invoked from the wrong state.
    #[error("join operation not valid in state {0:?}")]
    InvalidJoinState(JoinState),

    #[error("invalid launcher configuration: {0}")]
    InvalidConfig(String),

    /// The construction task panicked or was cancelled.
    #[error("account getter construction aborted: {0}")]
    ConstructionAborted(String),
}
