//! Point-in-time statistics over live window stores.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider label used when statistics span every provider.
pub const ALL_PROVIDERS: &str = "*";

/// Raw numbers copied out of one window store under its lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Records inside the main window
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// Sum of call durations of the counted records
    pub total_latency: Duration,
    /// Lifetime allow decisions
    pub allowed: u64,
    /// Lifetime deny decisions
    pub blocked: u64,
    /// Timestamp of the oldest counted record
    pub oldest: Option<Instant>,
}

/// Aggregate view of one provider's (or every provider's) window stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatistics {
    /// Provider name, or `*` for all providers
    pub provider: String,
    /// Number of live (provider, key) stores folded in
    pub active_keys: usize,
    /// Recorded calls still inside their window
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Checks that were allowed
    pub allowed_count: u64,
    /// Checks that were denied
    pub blocked_count: u64,
    /// Mean latency of the counted calls, in milliseconds
    pub average_latency_ms: f64,
    /// Wall-clock time of the oldest counted call
    pub window_start: DateTime<Utc>,
}

/// Additive accumulator for store snapshots.
#[derive(Debug, Default)]
pub(crate) struct StatisticsBuilder {
    active_keys: usize,
    totals: StoreSnapshot,
}

impl StatisticsBuilder {
    pub(crate) fn add(&mut self, snapshot: StoreSnapshot) {
        self.active_keys += 1;

        let totals = &mut self.totals;
        totals.total += snapshot.total;
        totals.successful += snapshot.successful;
        totals.failed += snapshot.failed;
        totals.total_latency += snapshot.total_latency;
        totals.allowed += snapshot.allowed;
        totals.blocked += snapshot.blocked;
        totals.oldest = match (totals.oldest, snapshot.oldest) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    /// Finish the fold. `now` and `wall_now` must describe the same moment.
    pub(crate) fn build(self, provider: &str, now: Instant, wall_now: DateTime<Utc>) -> ProviderStatistics {
        let totals = self.totals;

        let average_latency_ms = if totals.total == 0 {
            0.0
        } else {
            totals.total_latency.as_secs_f64() * 1000.0 / totals.total as f64
        };

        let window_start = totals
            .oldest
            .and_then(|oldest| chrono::Duration::from_std(now.saturating_duration_since(oldest)).ok())
            .map(|age| wall_now - age)
            .unwrap_or(wall_now);

        ProviderStatistics {
            provider: provider.to_string(),
            active_keys: self.active_keys,
            total_requests: totals.total,
            successful_requests: totals.successful,
            failed_requests: totals.failed,
            allowed_count: totals.allowed,
            blocked_count: totals.blocked,
            average_latency_ms,
            window_start,
        }
    }
}
