//! Admission controller for outbound provider calls.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use super::clock::{Clock, SystemClock};
use super::key::{normalize_provider, StoreKey};
use super::policy::{PolicyRegistry, ProviderPolicy};
use super::stats::{ProviderStatistics, StatisticsBuilder, ALL_PROVIDERS};
use super::window::{Reclaimed, RequestRecord, WindowStore, DEFAULT_IDLE_GRACE};
use crate::config::QuotaGuardConfig;
use crate::error::{QuotaGuardError, Result};

/// Remaining budget reported when the limiter fails open.
const PERMISSIVE_REMAINING: u32 = u32::MAX;
/// Reset hint reported when the limiter fails open.
const PERMISSIVE_RESET: Duration = Duration::from_secs(1);
/// Lookups attempted before a store that keeps getting reclaimed is treated as a fault.
const MAX_STORE_ATTEMPTS: usize = 3;

/// Why a check was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The main window budget is used up
    WindowExhausted,
    /// Too many requests inside the burst sub-window
    BurstExceeded,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::WindowExhausted => "rate limit exceeded for provider window",
            DenyReason::BurstExceeded => "burst limit exceeded for provider",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The answer to one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the caller may make the call now
    pub allowed: bool,
    /// Budget left in the main window after the call being admitted
    pub remaining: u32,
    /// Time until the oldest counted request expires
    pub reset_in: Duration,
    /// Set only when `allowed` is false
    pub denied_reason: Option<DenyReason>,
}

impl Decision {
    pub(crate) fn allow(remaining: u32, reset_in: Duration) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_in,
            denied_reason: None,
        }
    }

    pub(crate) fn deny(reason: DenyReason, reset_in: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_in,
            denied_reason: Some(reason),
        }
    }

    /// The decision returned when the limiter itself is broken.
    pub fn permissive() -> Self {
        Self::allow(PERMISSIVE_REMAINING, PERMISSIVE_RESET)
    }
}

/// The rate limiter that admits or denies outbound provider calls.
///
/// Each (provider, key) pair owns a [`WindowStore`] held in a concurrent map;
/// stores lock individually, so unrelated keys never contend. The limiter is
/// meant to be shared behind an `Arc` by every code path that talks to an
/// external provider, plus one [`super::Janitor`].
pub struct RateLimiter {
    /// Provider policies
    policies: PolicyRegistry,
    /// Window stores indexed by composite key
    stores: DashMap<StoreKey, Arc<WindowStore>>,
    /// Time source
    clock: Arc<dyn Clock>,
    /// Quiet period past the window before a store is reclaimed
    idle_grace: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter with the built-in provider policies.
    pub fn new() -> Self {
        Self::with_policies(PolicyRegistry::new())
    }

    /// Create a new rate limiter with the given policies.
    pub fn with_policies(policies: PolicyRegistry) -> Self {
        Self {
            policies,
            stores: DashMap::new(),
            clock: Arc::new(SystemClock),
            idle_grace: DEFAULT_IDLE_GRACE,
        }
    }

    /// Create a rate limiter from loaded configuration.
    pub fn from_config(config: &QuotaGuardConfig) -> Self {
        let mut policies = PolicyRegistry::new();
        policies.load(&config.rate_limiting.providers);
        Self::with_policies(policies).with_idle_grace(config.janitor.idle_grace())
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the idle grace period used by [`RateLimiter::sweep_idle`].
    pub fn with_idle_grace(mut self, idle_grace: Duration) -> Self {
        self.idle_grace = idle_grace;
        self
    }

    /// Get the policy registry.
    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Decide whether a call to `provider` on behalf of `key` may proceed.
    ///
    /// An allowed decision reserves one unit of budget for the call about to be
    /// made, so `remaining` already excludes it. This never fails: any internal
    /// fault is logged and answered with [`Decision::permissive`].
    pub fn check(&self, key: &str, provider: &str) -> Decision {
        match guard(|| self.evaluate(key, provider)) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    key = %key,
                    provider = %provider,
                    error = %e,
                    "Rate limit check failed, allowing request"
                );
                Decision::permissive()
            }
        }
    }

    fn evaluate(&self, key: &str, provider: &str) -> Result<Decision> {
        let store_key = StoreKey::new(key, provider)?;
        let policy = self.policies.resolve(&store_key.provider);
        let now = self.clock.now();

        let decision =
            self.with_store(&store_key, &policy, now, |store| store.admit(now, &policy))?;

        match decision.denied_reason {
            None => trace!(
                key = %store_key,
                remaining = decision.remaining,
                limit = policy.requests_per_window,
                "Request admitted"
            ),
            Some(reason) => debug!(
                key = %store_key,
                reason = %reason,
                limit = policy.requests_per_window,
                burst_limit = policy.burst_limit,
                "Request denied"
            ),
        }

        Ok(decision)
    }

    /// Record a completed call, whatever the outcome of its check was.
    pub fn record(&self, key: &str, provider: &str, success: bool, duration: Duration) {
        let result = guard(|| {
            let store_key = StoreKey::new(key, provider)?;
            let policy = self.policies.resolve(&store_key.provider);
            let now = self.clock.now();
            let record = RequestRecord::new(now, success, duration);
            self.with_store(&store_key, &policy, now, |store| store.record(record))?;
            trace!(
                key = %store_key,
                success = success,
                duration = ?duration,
                "Recorded request"
            );
            Ok(())
        });

        if let Err(e) = result {
            warn!(
                key = %key,
                provider = %provider,
                error = %e,
                "Failed to record request"
            );
        }
    }

    /// Discard the window store for a (provider, key) pair.
    pub fn reset(&self, key: &str, provider: &str) {
        let result = guard(|| {
            let store_key = StoreKey::new(key, provider)?;
            if self.stores.remove(&store_key).is_some() {
                debug!(key = %store_key, "Reset window store");
            }
            Ok(())
        });

        if let Err(e) = result {
            warn!(
                key = %key,
                provider = %provider,
                error = %e,
                "Failed to reset window store"
            );
        }
    }

    /// Aggregate statistics for one provider, or for every provider when `None`.
    pub fn statistics(&self, provider: Option<&str>) -> ProviderStatistics {
        let filter = provider.map(normalize_provider);
        let label = filter.as_deref().unwrap_or(ALL_PROVIDERS);

        let result = guard(|| {
            let stores: Vec<Arc<WindowStore>> = self
                .stores
                .iter()
                .filter(|entry| {
                    filter
                        .as_ref()
                        .map_or(true, |p| &entry.key().provider == p)
                })
                .map(|entry| Arc::clone(entry.value()))
                .collect();

            let (now, wall_now) = (self.clock.now(), Utc::now());
            let mut builder = StatisticsBuilder::default();
            for store in stores {
                builder.add(store.snapshot(now));
            }
            Ok(builder.build(label, now, wall_now))
        });

        result.unwrap_or_else(|e| {
            warn!(provider = %label, error = %e, "Failed to aggregate statistics");
            StatisticsBuilder::default().build(label, Instant::now(), Utc::now())
        })
    }

    /// Aggregate statistics for every provider with at least one live store.
    ///
    /// Returns an empty map if aggregation faults.
    pub fn statistics_by_provider(&self) -> BTreeMap<String, ProviderStatistics> {
        let result = guard(|| {
            let mut grouped: BTreeMap<String, Vec<Arc<WindowStore>>> = BTreeMap::new();
            for entry in self.stores.iter() {
                grouped
                    .entry(entry.key().provider.clone())
                    .or_default()
                    .push(Arc::clone(entry.value()));
            }

            let (now, wall_now) = (self.clock.now(), Utc::now());
            Ok(grouped
                .into_iter()
                .map(|(provider, stores)| {
                    let mut builder = StatisticsBuilder::default();
                    for store in stores {
                        builder.add(store.snapshot(now));
                    }
                    let stats = builder.build(&provider, now, wall_now);
                    (provider, stats)
                })
                .collect())
        });

        result.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to aggregate per-provider statistics");
            BTreeMap::new()
        })
    }

    /// Remove every store that has been quiet for its window plus the idle grace.
    ///
    /// Returns the number of stores removed. A store is marked reclaimed before
    /// it leaves the map, so a caller still holding it retries on a fresh one.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let grace = self.idle_grace;
        let mut removed = 0;

        self.stores.retain(|key, store| {
            let idle = store.reclaim_if_idle(now, grace);
            if idle {
                trace!(key = %key, "Reclaiming idle window store");
                removed += 1;
            }
            !idle
        });

        removed
    }

    /// Current main-window occupancy for a pair, or `None` if it has no store.
    pub fn occupancy(&self, key: &str, provider: &str) -> Option<usize> {
        let store_key = StoreKey::new(key, provider).ok()?;
        let store = self.stores.get(&store_key).map(|s| Arc::clone(s.value()))?;
        Some(store.count_in_window(self.clock.now(), None))
    }

    /// Get the number of live window stores.
    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    /// Drop every window store.
    pub fn clear(&self) {
        self.stores.clear();
    }

    /// Run `f` against the live store for `key`, looking it up again whenever
    /// the store turns out to have been reclaimed by a concurrent sweep.
    fn with_store<T>(
        &self,
        key: &StoreKey,
        policy: &ProviderPolicy,
        now: Instant,
        mut f: impl FnMut(&WindowStore) -> std::result::Result<T, Reclaimed>,
    ) -> Result<T> {
        for _ in 0..MAX_STORE_ATTEMPTS {
            let store = self.store_for(key, policy, now);
            match f(store.as_ref()) {
                Ok(value) => return Ok(value),
                Err(Reclaimed) => {
                    trace!(key = %key, "Window store reclaimed during access, retrying");
                }
            }
        }

        Err(QuotaGuardError::InternalFault(format!(
            "window store for {} reclaimed {} times in a row",
            key, MAX_STORE_ATTEMPTS
        )))
    }

    fn store_for(&self, key: &StoreKey, policy: &ProviderPolicy, now: Instant) -> Arc<WindowStore> {
        if let Some(store) = self.stores.get(key) {
            return Arc::clone(store.value());
        }

        let store = self.stores.entry(key.clone()).or_insert_with(|| {
            debug!(
                key = %key,
                limit = policy.requests_per_window,
                window = ?policy.window,
                "Creating new window store"
            );
            Arc::new(WindowStore::new(policy.window, now))
        });
        Arc::clone(store.value())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policies", &self.policies)
            .field("stores", &self.stores.len())
            .field("clock", &self.clock)
            .field("idle_grace", &self.idle_grace)
            .finish()
    }
}

/// Run `f`, turning a panic into an [`QuotaGuardError::InternalFault`].
fn guard<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(error = %message, "Panic inside rate limiter");
            Err(QuotaGuardError::InternalFault(message))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
