use std::time::Duration;

/// Minimum wall-clock time between background sweeps, triggered lazily from
/// whichever `add_and_acquire` call happens to notice it has elapsed.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Wall-clock time an idle cell may sit unused before a sweep closes it.
pub const IDLE_TTL: Duration = Duration::from_secs(30 * 60);

/// Tunables for a [`PoolCache`](crate::PoolCache).
///
/// Mirrors the teacher connection pool's `Config`: a plain struct with chained
/// builder methods, constructed once and handed to `PoolCache::new`.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub(crate) sweep_interval: Duration,
    pub(crate) idle_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sweep_interval: SWEEP_INTERVAL,
            idle_ttl: IDLE_TTL,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the minimum time between background sweeps.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Override how long an idle cell may sit unused before eviction.
    pub fn idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }
}
