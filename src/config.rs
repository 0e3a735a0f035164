//! Launcher configuration.
//!
//! The operating mode is chosen at runtime by the [`Backend`](crate::Backend)
//! handed to [`AccountGetter::create`](crate::AccountGetter::create); this
//! module holds the knobs shared by both modes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::LauncherError;

/// Two workers: one serial lane for health updates plus one for completions.
pub const DEFAULT_EXECUTOR_WORKERS: usize = 2;

/// Per-request bound on a public-key fetch.
pub const DEFAULT_KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of public-key requests in flight at once.
/// SECURITY: the overlay decides how often it asks, so the registry must
/// not grow without bound.
pub const DEFAULT_MAX_PENDING_KEY_REQUESTS: usize = 4096;

/// Which collaborators back an account getter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LauncherMode {
    /// Join a live overlay and fetch keys through its key/data engine.
    Live,
    /// Skip the overlay entirely and serve keys from an in-memory store.
    FakeStore,
}

impl LauncherMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LauncherMode::Live => "live",
            LauncherMode::FakeStore => "fake",
        }
    }
}

impl fmt::Display for LauncherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LauncherMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Ok(LauncherMode::Live),
            "fake" | "fake-store" | "fake_store" => Ok(LauncherMode::FakeStore),
            other => anyhow::bail!("unknown mode '{}' (expected 'live' or 'fake')", other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LauncherConfig {
    /// Number of executor lanes. Lane 0 always carries health updates.
    pub executor_workers: usize,
    /// Bound applied to every public-key fetch.
    pub key_fetch_timeout: Duration,
    /// Bound on the join wait. `None` waits until the overlay reports a
    /// terminal health score, however long that takes.
    pub join_timeout: Option<Duration>,
    /// Requests beyond this many in flight are refused immediately.
    pub max_pending_key_requests: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            executor_workers: DEFAULT_EXECUTOR_WORKERS,
            key_fetch_timeout: DEFAULT_KEY_FETCH_TIMEOUT,
            join_timeout: None,
            max_pending_key_requests: DEFAULT_MAX_PENDING_KEY_REQUESTS,
        }
    }
}

impl LauncherConfig {
    pub fn validate(&self) -> Result<(), LauncherError> {
        if self.executor_workers == 0 {
            return Err(LauncherError::InvalidConfig(
                "executor_workers must be at least 1".to_string(),
            ));
        }
        if self.key_fetch_timeout.is_zero() {
            return Err(LauncherError::InvalidConfig(
                "key_fetch_timeout must be non-zero".to_string(),
            ));
        }
        if self.join_timeout.is_some_and(|t| t.is_zero()) {
            return Err(LauncherError::InvalidConfig(
                "join_timeout must be non-zero when set".to_string(),
            ));
        }
        if self.max_pending_key_requests == 0 {
            return Err(LauncherError::InvalidConfig(
                "max_pending_key_requests must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
