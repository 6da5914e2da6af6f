//! Settings structs for the dispatch core.
//!
//! Pure data types with documented defaults. Components take these by value
//! at construction; there is no config-file layer; the embedding
//! application (or the daemon binary's flags) decides the values.

use std::time::Duration;

/// Default initial delay between redial attempts.
pub const DEFAULT_REDIAL_INITIAL_DELAY_MS: u64 = 100;

/// Default ceiling for redial backoff.
pub const DEFAULT_REDIAL_MAX_DELAY_SECS: u64 = 5;

/// Default grace period when waiting for a pool to drain on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Retry behaviour for dialing a peer that is not yet reachable.
///
/// Delay grows exponentially from `initial_delay` up to `max_delay`
/// (delay = initial * 2^attempt, capped).
#[derive(Clone, Debug)]
pub struct RetrySettings {
    /// Maximum dial attempts. `None` retries until cancelled.
    pub max_attempts: Option<u32>,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling on the backoff delay.
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(DEFAULT_REDIAL_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_REDIAL_MAX_DELAY_SECS),
        }
    }
}

impl RetrySettings {
    /// Backoff delay for the given (0-based) attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        (self.initial_delay * factor).min(self.max_delay)
    }
}

/// Settings shared by the dispatcher and direct-mode pools.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    /// How long `configure_daemons(0)` waits for the pool task to exit.
    pub shutdown_grace: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}
