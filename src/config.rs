//! Runtime configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Every knob has a compiled-in default. A missing or unparsable variable
//! falls back to the default rather than failing startup; the sync core has
//! no setting that is worth refusing to run over.

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::time::Duration;

use crate::object::CanvasBounds;

pub const DEFAULT_LEASE_TTL_MS: u64 = 10_000;
pub const DEFAULT_LEASE_RENEW_MS: u64 = 4_000;
pub const DEFAULT_UNDO_CAPACITY: usize = 50;
pub const DEFAULT_BATCH_CAP: usize = 500;
pub const DEFAULT_PENDING_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PENDING_SWEEP_MS: u64 = 1_000;
pub const DEFAULT_CANVAS_WIDTH: f64 = 5_000.0;
pub const DEFAULT_CANVAS_HEIGHT: f64 = 5_000.0;
pub const DEFAULT_OUTBOUND_RETRIES: usize = 2;
pub const DEFAULT_OUTBOUND_RETRY_BASE_MS: u64 = 20;
pub const DEFAULT_FEED_CHANNEL_CAPACITY: usize = 4_096;
pub const DEFAULT_PRESENCE_STALE_MS: i64 = 3_000;
pub const DEFAULT_CURSOR_THROTTLE_MS: i64 = 33;

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Advisory lease timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Lease lifetime from the moment it is written.
    pub ttl_ms: u64,
    /// Renewal period while an interaction is ongoing. Always below `ttl_ms`.
    pub renew_ms: u64,
}

impl LeaseConfig {
    /// Build a lease config, forcing the renewal period below the TTL so a
    /// held lease never lapses between renewals.
    #[must_use]
    pub fn new(ttl_ms: u64, renew_ms: u64) -> Self {
        let ttl_ms = ttl_ms.max(2);
        let renew_ms = if renew_ms == 0 || renew_ms >= ttl_ms { ttl_ms / 2 } else { renew_ms };
        Self { ttl_ms, renew_ms }
    }

    #[must_use]
    pub fn ttl(&self) -> i64 {
        i64::try_from(self.ttl_ms).unwrap_or(i64::MAX)
    }

    #[must_use]
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_ms)
    }
}

/// Outbound write retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per write, including the first.
    pub attempts: usize,
    /// Linear back-off step between attempts.
    pub base_ms: u64,
}

/// Everything a canvas session needs to know at construction time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConfig {
    pub lease: LeaseConfig,
    pub undo_capacity: usize,
    pub batch_cap: usize,
    pub pending_timeout_ms: i64,
    pub pending_sweep: Duration,
    pub bounds: CanvasBounds,
    pub retry: RetryConfig,
    pub feed_channel_capacity: usize,
    pub presence_stale_ms: i64,
    pub cursor_throttle_ms: i64,
}

impl SyncConfig {
    /// Build config from environment variables.
    ///
    /// - `LEASE_TTL_MS`, `LEASE_RENEW_MS`: lease lifetime and renewal period
    /// - `UNDO_CAPACITY`: undo stack cap
    /// - `BATCH_CAP`: objects accepted per batch create
    /// - `PENDING_TIMEOUT_MS`, `PENDING_SWEEP_MS`: pending confirmation timeout and sweep
    /// - `CANVAS_WIDTH`, `CANVAS_HEIGHT`: clamping bounds
    /// - `OUTBOUND_RETRIES`, `OUTBOUND_RETRY_BASE_MS`: remote write retries
    /// - `FEED_CHANNEL_CAPACITY`: change stream buffer
    /// - `PRESENCE_STALE_MS`, `CURSOR_THROTTLE_MS`: presence timing
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            lease: LeaseConfig::new(
                env_parse("LEASE_TTL_MS", DEFAULT_LEASE_TTL_MS),
                env_parse("LEASE_RENEW_MS", DEFAULT_LEASE_RENEW_MS),
            ),
            undo_capacity: env_parse("UNDO_CAPACITY", DEFAULT_UNDO_CAPACITY).max(1),
            batch_cap: env_parse("BATCH_CAP", DEFAULT_BATCH_CAP).max(1),
            pending_timeout_ms: env_parse("PENDING_TIMEOUT_MS", millis(DEFAULT_PENDING_TIMEOUT_MS)),
            pending_sweep: Duration::from_millis(env_parse("PENDING_SWEEP_MS", DEFAULT_PENDING_SWEEP_MS).max(1)),
            bounds: CanvasBounds {
                width: env_parse("CANVAS_WIDTH", DEFAULT_CANVAS_WIDTH),
                height: env_parse("CANVAS_HEIGHT", DEFAULT_CANVAS_HEIGHT),
            },
            retry: RetryConfig {
                attempts: env_parse("OUTBOUND_RETRIES", DEFAULT_OUTBOUND_RETRIES).max(1),
                base_ms: env_parse("OUTBOUND_RETRY_BASE_MS", DEFAULT_OUTBOUND_RETRY_BASE_MS),
            },
            feed_channel_capacity: env_parse("FEED_CHANNEL_CAPACITY", DEFAULT_FEED_CHANNEL_CAPACITY).max(1),
            presence_stale_ms: env_parse("PRESENCE_STALE_MS", DEFAULT_PRESENCE_STALE_MS),
            cursor_throttle_ms: env_parse("CURSOR_THROTTLE_MS", DEFAULT_CURSOR_THROTTLE_MS),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lease: LeaseConfig::new(DEFAULT_LEASE_TTL_MS, DEFAULT_LEASE_RENEW_MS),
            undo_capacity: DEFAULT_UNDO_CAPACITY,
            batch_cap: DEFAULT_BATCH_CAP,
            pending_timeout_ms: millis(DEFAULT_PENDING_TIMEOUT_MS),
            pending_sweep: Duration::from_millis(DEFAULT_PENDING_SWEEP_MS),
            bounds: CanvasBounds { width: DEFAULT_CANVAS_WIDTH, height: DEFAULT_CANVAS_HEIGHT },
            retry: RetryConfig { attempts: DEFAULT_OUTBOUND_RETRIES, base_ms: DEFAULT_OUTBOUND_RETRY_BASE_MS },
            feed_channel_capacity: DEFAULT_FEED_CHANNEL_CAPACITY,
            presence_stale_ms: DEFAULT_PRESENCE_STALE_MS,
            cursor_throttle_ms: DEFAULT_CURSOR_THROTTLE_MS,
        }
    }
}

fn millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}
