//! # Network Health
//!
//! The overlay summarises connectivity as a single integer score:
//!
//! | Score | Meaning |
//! |-------|---------|
//! | `>= CONNECTED_THRESHOLD` (100) | joined |
//! | `< SEVERE_FAILURE_THRESHOLD` (-300000) | permanently disconnected |
//! | anything else | still joining |
//!
//! [`HealthState`] stores the most recently applied score. Updates must only
//! be applied from the executor's serial lane, which makes it the single
//! writer; waiters subscribe to a `watch` channel and are woken on every
//! update.
//!
//! The first terminal score latches a [`HealthResolution`]. Later updates
//! still replace the score, but never the resolution, so a waiter that wakes
//! after a `100` was overwritten by a `90` still sees the join succeed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::identity::NodeId;

/// Scores at or above this mean the node has fully joined.
pub const CONNECTED_THRESHOLD: i32 = 100;

/// Scores below this mean the overlay has given up on this node.
pub const SEVERE_FAILURE_THRESHOLD: i32 = -300_000;

/// Score before the overlay has reported anything.
pub const INITIAL_HEALTH: i32 = -1;

/// Terminal outcome of the join wait, carrying the score that caused it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthResolution {
    Connected(i32),
    Disconnected(i32),
}

impl HealthResolution {
    /// Classify a score, returning `None` while it is still in progress.
    pub fn classify(score: i32) -> Option<Self> {
        if score >= CONNECTED_THRESHOLD {
            Some(HealthResolution::Connected(score))
        } else if score < SEVERE_FAILURE_THRESHOLD {
            Some(HealthResolution::Disconnected(score))
        } else {
            None
        }
    }

    pub fn score(&self) -> i32 {
        match self {
            HealthResolution::Connected(score) | HealthResolution::Disconnected(score) => *score,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, HealthResolution::Connected(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub score: i32,
    pub resolution: Option<HealthResolution>,
    /// Number of updates applied so far.
    pub updates: u64,
}

/// Shared, single-writer network health score.
#[derive(Clone)]
pub struct HealthState {
    tx: Arc<watch::Sender<HealthSnapshot>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HealthSnapshot {
            score: INITIAL_HEALTH,
            resolution: None,
            updates: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Store `new_score` and wake every waiter.
    ///
    /// Call only from the executor's serial lane.
    pub fn apply_update(&self, new_score: i32, source_peer: NodeId) {
        let mut previous = INITIAL_HEALTH;
        let mut resolved = None;
        self.tx.send_modify(|snapshot| {
            previous = snapshot.score;
            snapshot.score = new_score;
            snapshot.updates += 1;
            if snapshot.resolution.is_none() {
                snapshot.resolution = HealthResolution::classify(new_score);
                resolved = snapshot.resolution;
            }
        });

        if previous != new_score {
            debug!(previous, score = new_score, peer = ?source_peer, "network health changed");
        }
        match resolved {
            Some(HealthResolution::Connected(score)) => {
                info!(score, peer = ?source_peer, "overlay connected");
            }
            Some(HealthResolution::Disconnected(score)) => {
                warn!(score, peer = ?source_peer, "overlay reported severe failure");
            }
            None => {}
        }
    }

    pub fn current(&self) -> i32 {
        self.tx.borrow().score
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        *self.tx.borrow()
    }

    /// Wait until the score has crossed either threshold.
    ///
    /// There is no bound here: an overlay that never reports a terminal score
    /// leaves the caller waiting. Use [`wait_until_resolved_for`] when that is
    /// unacceptable.
    ///
    /// [`wait_until_resolved_for`]: HealthState::wait_until_resolved_for
    pub async fn wait_until_resolved(&self) -> HealthResolution {
        let mut rx = self.tx.subscribe();
        let resolved = rx
            .wait_for(|snapshot| snapshot.resolution.is_some())
            .await
            .ok()
            .and_then(|snapshot| snapshot.resolution);

        // The sender lives as long as `self`, so the channel cannot close
        // while we wait; fall back to classifying whatever is stored.
        resolved.unwrap_or_else(|| {
            let score = self.current();
            HealthResolution::classify(score).unwrap_or(HealthResolution::Disconnected(score))
        })
    }

    /// Like [`wait_until_resolved`](HealthState::wait_until_resolved) but
    /// gives up after `timeout`.
    pub async fn wait_until_resolved_for(&self, timeout: Duration) -> Option<HealthResolution> {
        tokio::time::timeout(timeout, self.wait_until_resolved()).await.ok()
    }
}
