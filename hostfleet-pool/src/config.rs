//! Pool timing configuration.

use std::time::Duration;

/// Default maximum idle time before a connection is evicted.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(30 * 60);

/// Default interval between health-check passes.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default interval between idle-cleanup passes.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Timing knobs for [`ConnectionPool`](crate::ConnectionPool).
///
/// Zero durations fall back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections unused for longer than this are closed
    pub max_idle: Duration,
    /// How often connected entries are probed
    pub health_check_interval: Duration,
    /// How often idle entries are looked for
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl PoolConfig {
    pub fn new(max_idle: Duration, health_check_interval: Duration) -> Self {
        Self {
            max_idle,
            health_check_interval,
            ..Self::default()
        }
        .normalized()
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self.normalized()
    }

    /// Replace zero durations with defaults.
    pub fn normalized(mut self) -> Self {
        if self.max_idle.is_zero() {
            self.max_idle = DEFAULT_MAX_IDLE;
        }
        if self.health_check_interval.is_zero() {
            self.health_check_interval = DEFAULT_HEALTH_CHECK_INTERVAL;
        }
        if self.cleanup_interval.is_zero() {
            self.cleanup_interval = DEFAULT_CLEANUP_INTERVAL;
        }
        self
    }
}
