//! Rate limiter trait for the code paths that call external providers.

use std::time::Duration;

use async_trait::async_trait;

use super::limiter::{Decision, RateLimiter};
use super::stats::ProviderStatistics;

/// Trait for rate limiter implementations.
///
/// Provider clients depend on this trait rather than on [`RateLimiter`] so they
/// can be tested against a stub. None of the operations perform I/O, and
/// dropping one of the futures before completion leaves the limiter unchanged.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide whether a call to `provider` on behalf of `key` may proceed.
    async fn check(&self, key: &str, provider: &str) -> Decision;

    /// Report the outcome of a completed call.
    async fn record(&self, key: &str, provider: &str, success: bool, duration: Duration);

    /// Forget all history for a (provider, key) pair.
    async fn reset(&self, key: &str, provider: &str);

    /// Aggregate statistics for one provider, or all providers when `None`.
    async fn statistics(&self, provider: Option<&str>) -> ProviderStatistics;
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn check(&self, key: &str, provider: &str) -> Decision {
        RateLimiter::check(self, key, provider)
    }

    async fn record(&self, key: &str, provider: &str, success: bool, duration: Duration) {
        RateLimiter::record(self, key, provider, success, duration)
    }

    async fn reset(&self, key: &str, provider: &str) {
        RateLimiter::reset(self, key, provider)
    }

    async fn statistics(&self, provider: Option<&str>) -> ProviderStatistics {
        RateLimiter::statistics(self, provider)
    }
}
