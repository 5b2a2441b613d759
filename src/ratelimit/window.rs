//! Sliding window store implementation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::limiter::{Decision, DenyReason};
use super::policy::ProviderPolicy;
use super::stats::StoreSnapshot;

/// Record count above which a store purges expired entries on write instead of
/// waiting for the next read.
pub const HIGH_WATER_MARK: usize = 10_000;

/// Default quiet period past the window before a store may be reclaimed.
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(300);

/// One completed external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    /// When the call completed
    pub timestamp: Instant,
    /// Whether the provider reported success
    pub success: bool,
    /// How long the call took
    pub duration: Duration,
}

impl RequestRecord {
    pub fn new(timestamp: Instant, success: bool, duration: Duration) -> Self {
        Self {
            timestamp,
            success,
            duration,
        }
    }
}

/// Returned when a store has already been removed by a sweep.
///
/// The caller must look the key up again; the registry will hand out a fresh store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reclaimed;

/// State guarded by the store's mutex.
#[derive(Debug)]
struct WindowState {
    /// Records ordered by timestamp, oldest first
    records: VecDeque<RequestRecord>,
    /// Checks answered with allow since the store was created
    allowed: u64,
    /// Checks answered with deny since the store was created
    blocked: u64,
    /// Last check or record touching this store
    last_activity: Instant,
    /// Set once a sweep has removed the store from the registry
    reclaimed: bool,
}

impl WindowState {
    fn touch(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    fn is_idle(&self, now: Instant, window: Duration, grace: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > window.saturating_add(grace)
    }
}

/// A sliding window of request records for one (provider, key) pair.
///
/// Expired records are purged lazily when the window is read. Every access goes
/// through the store's own mutex, so callers only contend with callers sharing
/// the exact same bucket.
#[derive(Debug)]
pub struct WindowStore {
    /// Length of the main window
    window: Duration,
    state: Mutex<WindowState>,
}

impl WindowStore {
    /// Create an empty store.
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            state: Mutex::new(WindowState {
                records: VecDeque::new(),
                allowed: 0,
                blocked: 0,
                last_activity: now,
                reclaimed: false,
            }),
        }
    }

    /// Get the main window duration of this store.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count records inside `[now - window, now]`.
    ///
    /// Records older than the main window are purged first. When a sub-window is
    /// given, only records inside it are counted; records between the sub-window
    /// and the main window are kept because they still consume main-window budget.
    pub fn count_in_window(&self, now: Instant, window_override: Option<Duration>) -> usize {
        let mut state = self.state.lock();
        purge(&mut state.records, cutoff(now, self.window));
        count_within(&state.records, now, window_override.unwrap_or(self.window).min(self.window))
    }

    /// Answer one admission check for `policy` in a single critical section.
    ///
    /// Counts the main window, then the burst sub-window, updates the decision
    /// counters and computes the reset hint without releasing the lock.
    pub fn admit(&self, now: Instant, policy: &ProviderPolicy) -> Result<Decision, Reclaimed> {
        let mut state = self.state.lock();
        if state.reclaimed {
            return Err(Reclaimed);
        }
        purge(&mut state.records, cutoff(now, self.window));

        let occupancy = state.records.len();
        let limit = policy.requests_per_window as usize;

        let decision = if occupancy >= limit {
            Decision::deny(
                DenyReason::WindowExhausted,
                reset_within(&state.records, now, self.window),
            )
        } else if policy.has_burst()
            && count_within(&state.records, now, policy.burst_window.min(self.window))
                >= policy.burst_limit as usize
        {
            Decision::deny(
                DenyReason::BurstExceeded,
                reset_within(&state.records, now, policy.burst_window),
            )
        } else {
            // occupancy < limit <= u32::MAX
            Decision::allow(
                (limit - occupancy - 1) as u32,
                reset_within(&state.records, now, self.window),
            )
        };

        if decision.allowed {
            state.allowed += 1;
        } else {
            state.blocked += 1;
        }
        state.touch(now);

        Ok(decision)
    }

    /// Append a record.
    pub fn record(&self, record: RequestRecord) -> Result<(), Reclaimed> {
        let mut state = self.state.lock();
        if state.reclaimed {
            return Err(Reclaimed);
        }

        // Concurrent callers may stamp records slightly out of order before they
        // reach the lock; keep the deque sorted.
        let position = match state.records.back() {
            Some(last) if last.timestamp > record.timestamp => {
                state.records.partition_point(|r| r.timestamp <= record.timestamp)
            }
            _ => state.records.len(),
        };
        state.records.insert(position, record);
        state.touch(record.timestamp);

        if state.records.len() > HIGH_WATER_MARK {
            purge(&mut state.records, cutoff(record.timestamp, self.window));
        }
        Ok(())
    }

    /// Time until the oldest counted record leaves the main window.
    pub fn reset_in(&self, now: Instant) -> Duration {
        self.reset_in_within(now, self.window)
    }

    /// Time until the oldest record inside `window` leaves it; zero when none is.
    pub fn reset_in_within(&self, now: Instant, window: Duration) -> Duration {
        let state = self.state.lock();
        reset_within(&state.records, now, window)
    }

    /// Whether the store has seen no traffic for longer than its window plus `grace`.
    pub fn is_idle(&self, now: Instant, grace: Duration) -> bool {
        self.state.lock().is_idle(now, self.window, grace)
    }

    /// Mark the store reclaimed if it is idle. Returns whether it was.
    ///
    /// Once reclaimed, the store refuses further admissions and records, so a
    /// caller racing the sweep retries against a fresh store instead of writing
    /// into one that is no longer reachable.
    pub fn reclaim_if_idle(&self, now: Instant, grace: Duration) -> bool {
        let mut state = self.state.lock();
        if state.is_idle(now, self.window, grace) {
            state.reclaimed = true;
        }
        state.reclaimed
    }

    /// Take a point-in-time copy of the live records and decision counters.
    pub fn snapshot(&self, now: Instant) -> StoreSnapshot {
        let state = self.state.lock();
        let start = cutoff(now, self.window).map_or(0, |c| first_at_or_after(&state.records, c));

        let mut snapshot = StoreSnapshot {
            allowed: state.allowed,
            blocked: state.blocked,
            oldest: state.records.get(start).map(|r| r.timestamp),
            ..StoreSnapshot::default()
        };

        for record in state.records.range(start..) {
            snapshot.total += 1;
            if record.success {
                snapshot.successful += 1;
            } else {
                snapshot.failed += 1;
            }
            snapshot.total_latency += record.duration;
        }

        snapshot
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Earliest instant still inside a window ending at `now`.
///
/// `None` means the window reaches back before the clock's epoch, so nothing
/// can have expired yet.
fn cutoff(now: Instant, window: Duration) -> Option<Instant> {
    now.checked_sub(window)
}

fn first_at_or_after(records: &VecDeque<RequestRecord>, cutoff: Instant) -> usize {
    records.partition_point(|r| r.timestamp < cutoff)
}

fn count_within(records: &VecDeque<RequestRecord>, now: Instant, window: Duration) -> usize {
    let start = cutoff(now, window).map_or(0, |c| first_at_or_after(records, c));
    records.len() - start
}

fn reset_within(records: &VecDeque<RequestRecord>, now: Instant, window: Duration) -> Duration {
    let start = cutoff(now, window).map_or(0, |c| first_at_or_after(records, c));
    records
        .get(start)
        .map(|oldest| match oldest.timestamp.checked_add(window) {
            Some(expires) => expires.saturating_duration_since(now),
            None => Duration::MAX,
        })
        .unwrap_or(Duration::ZERO)
}

fn purge(records: &mut VecDeque<RequestRecord>, cutoff: Option<Instant>) {
    let Some(cutoff) = cutoff else {
        return;
    };
    while records.front().is_some_and(|r| r.timestamp < cutoff) {
        records.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn record_at(store: &WindowStore, at: Instant) {
        store
            .record(RequestRecord::new(at, true, Duration::from_millis(10)))
            .unwrap();
    }

    #[test]
    fn test_empty_store() {
        let t0 = Instant::now();
        let store = WindowStore::new(MINUTE, t0);

        assert_eq!(store.count_in_window(t0, None), 0);
        assert_eq!(store.reset_in(t0), Duration::ZERO);
        assert!(store.is_empty());
    }

    #[test]
    fn test_count_matches_records_inside_window() {
        let t0 = Instant::now();
        let store = WindowStore::new(MINUTE, t0);

        for i in 0..10 {
            record_at(&store, t0 + secs(i * 10));
        }

        // Records at 0..=90s; window at t=100 covers [40, 100].
        assert_eq!(store.count_in_window(t0 + secs(100), None), 6);
        // Purged on read.
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let t0 = Instant::now();
        let store = WindowStore::new(MINUTE, t0);
        record_at(&store, t0);

        assert_eq!(store.count_in_window(t0 + MINUTE, None), 1);
        assert_eq!(store.count_in_window(t0 + MINUTE + Duration::from_millis(1), None), 0);
    }

    #[test]
    fn test_burst_override_does_not_purge_main_window() {
        let t0 = Instant::now();
        let store = WindowStore::new(MINUTE, t0);

        record_at(&store, t0);
        record_at(&store, t0 + secs(30));
        record_at(&store, t0 + secs(45));

        let now = t0 + secs(50);
        assert_eq!(store.count_in_window(now, Some(secs(10))), 1);
        assert_eq!(store.count_in_window(now, None), 3);
    }

    #[test]
    fn test_override_longer_than_window_counts_main_window() {
        let t0 = Instant::now();
        let store = WindowStore::new(secs(10), t0);
        record_at(&store, t0);
        record_at(&store, t0 + secs(15));

        assert_eq!(store.count_in_window(t0 + secs(15), Some(MINUTE)), 1);
    }

    #[test]
    fn test_out_of_order_records_stay_sorted() {
        let t0 = Instant::now();
        let store = WindowStore::new(MINUTE, t0);

        record_at(&store, t0 + secs(20));
        record_at(&store, t0 + secs(5));
        record_at(&store, t0 + secs(10));

        // Window at t=66 covers [6, 66]; only the 5s record is expired.
        assert_eq!(store.count_in_window(t0 + secs(66), None), 2);
        assert_eq!(store.reset_in(t0 + secs(66)), secs(4));
    }

    #[test]
    fn test_reset_in_tracks_oldest_counted_record() {
        let t0 = Instant::now();
        let store = WindowStore::new(MINUTE, t0);

        record_at(&store, t0);
        record_at(&store, t0 + secs(20));

        assert_eq!(store.reset_in(t0 + secs(30)), secs(30));
        // First record has expired; the second is now the oldest.
        assert_eq!(store.reset_in(t0 + secs(61)), secs(19));
        assert_eq!(store.reset_in(t0 + secs(200)), Duration::ZERO);
    }

    #[test]
    fn test_reset_in_within_sub_window() {
        let t0 = Instant::now();
        let store = WindowStore::new(MINUTE, t0);

        record_at(&store, t0);
        record_at(&store, t0 + secs(25));
        record_at(&store, t0 + secs(28));

        assert_eq!(store.reset_in_within(t0 + secs(30), secs(10)), secs(5));
    }

    #[test]
    fn test_reset_in_saturates_for_unrepresentable_expiry() {
        let t0 = Instant::now();
        let store = WindowStore::new(Duration::MAX, t0);
        record_at(&store, t0);

        assert_eq!(store.count_in_window(t0, None), 1);
        assert_eq!(store.reset_in(t0), Duration::MAX);
        assert!(!store.is_idle(t0 + secs(3600), DEFAULT_IDLE_GRACE));
    }

    #[test]
    fn test_high_water_mark_purges_on_write() {
        let t0 = Instant::now();
        let store = WindowStore::new(secs(1), t0);

        for i in 0..HIGH_WATER_MARK as u64 {
            store
                .record(RequestRecord::new(
                    t0 + Duration::from_micros(i),
                    true,
                    Duration::ZERO,
                ))
                .unwrap();
        }
        assert_eq!(store.len(), HIGH_WATER_MARK);

        // The next write lands far past the window and drags everything out.
        record_at(&store, t0 + secs(10));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_idle_after_window_plus_grace() {
        let t0 = Instant::now();
        let store = WindowStore::new(MINUTE, t0);
        record_at(&store, t0);

        assert!(!store.is_idle(t0 + MINUTE + DEFAULT_IDLE_GRACE, DEFAULT_IDLE_GRACE));
        assert!(store.is_idle(t0 + MINUTE + DEFAULT_IDLE_GRACE + secs(1), DEFAULT_IDLE_GRACE));
    }

    #[test]
    fn test_admit_window_and_burst() {
        let t0 = Instant::now();
        let policy = ProviderPolicy::new("google", 3, MINUTE).with_burst(2, secs(10));
        let store = WindowStore::new(MINUTE, t0);

        let first = store.admit(t0, &policy).unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 2);

        record_at(&store, t0);
        record_at(&store, t0 + secs(1));
        let burst = store.admit(t0 + secs(2), &policy).unwrap();
        assert_eq!(burst.denied_reason, Some(DenyReason::BurstExceeded));
        assert_eq!(burst.reset_in, secs(8));

        record_at(&store, t0 + secs(20));
        let window = store.admit(t0 + secs(30), &policy).unwrap();
        assert_eq!(window.denied_reason, Some(DenyReason::WindowExhausted));
        assert_eq!(window.reset_in, secs(30));

        let snapshot = store.snapshot(t0 + secs(30));
        assert_eq!(snapshot.allowed, 1);
        assert_eq!(snapshot.blocked, 2);
    }

    #[test]
    fn test_decisions_refresh_activity() {
        let t0 = Instant::now();
        let store = WindowStore::new(MINUTE, t0);
        let policy = ProviderPolicy::new("google", 10, MINUTE);

        store.admit(t0 + secs(300), &policy).unwrap();
        assert!(!store.is_idle(t0 + secs(600), DEFAULT_IDLE_GRACE));
    }

    #[test]
    fn test_reclaimed_store_refuses_writes() {
        let t0 = Instant::now();
        let store = WindowStore::new(MINUTE, t0);
        let policy = ProviderPolicy::new("google", 10, MINUTE);
        record_at(&store, t0);

        assert!(!store.reclaim_if_idle(t0 + secs(10), DEFAULT_IDLE_GRACE));
        assert!(store.admit(t0 + secs(10), &policy).is_ok());

        let later = t0 + secs(10) + MINUTE + DEFAULT_IDLE_GRACE + secs(1);
        assert!(store.reclaim_if_idle(later, DEFAULT_IDLE_GRACE));
        assert_eq!(
            store.record(RequestRecord::new(later, true, Duration::ZERO)),
            Err(Reclaimed)
        );
        assert_eq!(store.admit(later, &policy), Err(Reclaimed));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_snapshot() {
        let t0 = Instant::now();
        let store = WindowStore::new(MINUTE, t0);
        let policy = ProviderPolicy::new("google", 1, MINUTE);

        store.record(RequestRecord::new(t0, true, Duration::from_millis(100))).unwrap();
        store.admit(t0 + secs(65), &policy).unwrap();
        store.record(RequestRecord::new(t0 + secs(70), true, Duration::from_millis(20))).unwrap();
        store.record(RequestRecord::new(t0 + secs(75), false, Duration::from_millis(40))).unwrap();
        store.admit(t0 + secs(75), &policy).unwrap();

        let snapshot = store.snapshot(t0 + secs(80));
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.successful, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.total_latency, Duration::from_millis(60));
        assert_eq!(snapshot.allowed, 1);
        assert_eq!(snapshot.blocked, 1);
        assert_eq!(snapshot.oldest, Some(t0 + secs(70)));
    }
}
