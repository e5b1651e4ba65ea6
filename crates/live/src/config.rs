//! Polling cadences and merge thresholds.

use std::time::Duration;

/// Tuning knobs for the live stores.
///
/// The defaults match the production cadences; tests shrink them to keep
/// timers out of the way.
#[derive(Clone, Debug)]
pub struct LiveConfig {
    /// Background position poll period.
    pub position_poll_interval: Duration,
    /// A full refresh is forced once this much time has passed since the
    /// previous one, even if incremental polls kept succeeding.
    pub full_refresh_interval: Duration,
    /// Incremental cutoffs are backed off by this margin to tolerate clock
    /// skew and boundary misses at the source.
    pub incremental_margin: Duration,
    /// Position records older than this are evicted after every merge.
    pub stale_after: Duration,
    /// Background event poll period.
    pub event_poll_interval: Duration,
    /// Max route lookups drained into one batch.
    pub route_batch_size: usize,
    /// Upstream per-request record cap for route announcements.
    pub route_request_limit: usize,
    /// Lookback window for route announcements, in minutes.
    pub route_window_minutes: u32,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            position_poll_interval: Duration::from_secs(45),
            full_refresh_interval: Duration::from_secs(5 * 45),
            incremental_margin: Duration::from_secs(5),
            stale_after: Duration::from_secs(10 * 60),
            event_poll_interval: Duration::from_secs(150),
            route_batch_size: 80,
            route_request_limit: 400,
            route_window_minutes: 2880,
        }
    }
}
