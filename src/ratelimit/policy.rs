//! Provider policy configuration and lookup.
//!
//! Every external provider gets a request budget per sliding window and an
//! optional burst budget per shorter sub-window. Built-in defaults follow the
//! order of magnitude of each vendor's published quota; operators may override
//! them per provider. Lookups never fail: unknown providers get a conservative
//! generic policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::key::normalize_provider;
use crate::error::{QuotaGuardError, Result};

/// Requests per window for providers without a policy.
const GENERIC_REQUESTS_PER_WINDOW: u32 = 100;
/// Window for providers without a policy.
const GENERIC_WINDOW: Duration = Duration::from_secs(60);
/// Burst limit for providers without a policy.
const GENERIC_BURST_LIMIT: u32 = 10;
/// Burst sub-window for providers without a policy.
const GENERIC_BURST_WINDOW: Duration = Duration::from_secs(10);

/// Longest main or burst window a configured policy may ask for (seven days).
///
/// Window arithmetic is done on monotonic instants, so windows are bounded well
/// below the range where `Instant + window` could overflow.
pub const MAX_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// The budget enforced for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderPolicy {
    /// Provider name, lowercased
    pub provider: String,
    /// Maximum requests allowed in the main window
    pub requests_per_window: u32,
    /// Length of the main window
    pub window: Duration,
    /// Maximum requests allowed in the burst sub-window; 0 disables burst checking
    pub burst_limit: u32,
    /// Length of the burst sub-window
    pub burst_window: Duration,
    /// Reserved for adaptive limits; not consulted yet
    pub adaptive_enabled: bool,
}

impl ProviderPolicy {
    /// Create a policy with no burst limit.
    pub fn new(provider: &str, requests_per_window: u32, window: Duration) -> Self {
        Self {
            provider: normalize_provider(provider),
            requests_per_window,
            window,
            burst_limit: 0,
            burst_window: GENERIC_BURST_WINDOW,
            adaptive_enabled: false,
        }
    }

    /// Add a burst sub-window to this policy.
    pub fn with_burst(mut self, burst_limit: u32, burst_window: Duration) -> Self {
        self.burst_limit = burst_limit;
        self.burst_window = burst_window;
        self
    }

    /// The fallback policy, named after the provider it stands in for.
    pub fn generic(provider: &str) -> Self {
        Self::new(provider, GENERIC_REQUESTS_PER_WINDOW, GENERIC_WINDOW)
            .with_burst(GENERIC_BURST_LIMIT, GENERIC_BURST_WINDOW)
    }

    /// Whether the burst sub-window is enforced.
    pub fn has_burst(&self) -> bool {
        self.burst_limit > 0
    }
}

/// Operator-supplied policy for one provider, as it appears in configuration.
///
/// Fields are signed so that negative values can be reported instead of
/// failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Number of requests allowed per window
    pub requests_per_window: i64,
    /// Window length in seconds
    pub window_duration_seconds: i64,
    /// Burst limit; 0 disables burst checking
    #[serde(default)]
    pub burst_limit: i64,
    /// Burst sub-window length in seconds
    #[serde(default = "default_burst_window_seconds")]
    pub burst_window_seconds: i64,
    #[serde(default)]
    pub adaptive_enabled: bool,
}

fn default_burst_window_seconds() -> i64 {
    GENERIC_BURST_WINDOW.as_secs() as i64
}

impl PolicyConfig {
    /// Validate this configuration and convert it into a policy.
    pub fn to_policy(&self, provider: &str) -> Result<ProviderPolicy> {
        let invalid = |reason: String| QuotaGuardError::InvalidPolicy {
            provider: provider.to_string(),
            reason,
        };

        let max_window_seconds = MAX_WINDOW.as_secs() as i64;
        if self.window_duration_seconds <= 0 || self.window_duration_seconds > max_window_seconds {
            return Err(invalid(format!(
                "window_duration_seconds must be between 1 and {}, got {}",
                max_window_seconds, self.window_duration_seconds
            )));
        }
        let requests_per_window = u32::try_from(self.requests_per_window).map_err(|_| {
            invalid(format!(
                "requests_per_window must be between 0 and {}, got {}",
                u32::MAX,
                self.requests_per_window
            ))
        })?;
        let burst_limit = u32::try_from(self.burst_limit).map_err(|_| {
            invalid(format!(
                "burst_limit must be between 0 and {}, got {}",
                u32::MAX,
                self.burst_limit
            ))
        })?;
        if burst_limit > 0
            && (self.burst_window_seconds <= 0 || self.burst_window_seconds > max_window_seconds)
        {
            return Err(invalid(format!(
                "burst_window_seconds must be between 1 and {} when burst_limit is set, got {}",
                max_window_seconds, self.burst_window_seconds
            )));
        }

        let mut policy = ProviderPolicy::new(
            provider,
            requests_per_window,
            Duration::from_secs(self.window_duration_seconds as u64),
        );
        if burst_limit > 0 {
            policy = policy.with_burst(
                burst_limit,
                Duration::from_secs(self.burst_window_seconds as u64),
            );
        }
        policy.adaptive_enabled = self.adaptive_enabled;
        Ok(policy)
    }
}

/// Maps provider names to their policies.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    /// Policies keyed by lowercased provider name
    policies: HashMap<String, ProviderPolicy>,
}

impl PolicyRegistry {
    /// Create a registry seeded with the built-in provider defaults.
    pub fn new() -> Self {
        let defaults = [
            // Calendar API: on the order of 1,000 queries per 100 seconds per user.
            ProviderPolicy::new("google", 1000, Duration::from_secs(100))
                .with_burst(50, Duration::from_secs(10)),
            // Graph: 10,000 requests per 10 minutes per app per mailbox.
            ProviderPolicy::new("microsoft", 10_000, Duration::from_secs(600))
                .with_burst(150, Duration::from_secs(10)),
            ProviderPolicy::new("apple", 60, Duration::from_secs(60))
                .with_burst(10, Duration::from_secs(10)),
            ProviderPolicy::new("caldav", 60, Duration::from_secs(60))
                .with_burst(5, Duration::from_secs(10)),
            // Web API tier 3: about 50 calls per minute, one message per second.
            ProviderPolicy::new("slack", 50, Duration::from_secs(60))
                .with_burst(1, Duration::from_secs(1)),
            ProviderPolicy::new("webhook", 120, Duration::from_secs(60))
                .with_burst(20, Duration::from_secs(10)),
        ];

        Self {
            policies: defaults
                .into_iter()
                .map(|p| (p.provider.clone(), p))
                .collect(),
        }
    }

    /// Create a registry with no built-in policies; everything resolves to the generic default.
    pub fn empty() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    /// Overlay operator-supplied policies, replacing defaults with the same name.
    ///
    /// An invalid entry is replaced by the generic policy and a warning is logged;
    /// loading never fails.
    pub fn load(&mut self, overrides: &HashMap<String, PolicyConfig>) {
        for (name, config) in overrides {
            let provider = normalize_provider(name);
            let policy = match config.to_policy(&provider) {
                Ok(policy) => policy,
                Err(e) => {
                    warn!(
                        provider = %provider,
                        error = %e,
                        "Invalid provider policy, using generic default"
                    );
                    ProviderPolicy::generic(&provider)
                }
            };

            debug!(
                provider = %provider,
                requests_per_window = policy.requests_per_window,
                window = ?policy.window,
                burst_limit = policy.burst_limit,
                burst_window = ?policy.burst_window,
                "Loaded provider policy"
            );
            self.policies.insert(provider, policy);
        }

        info!(policies = self.policies.len(), "Provider policies loaded");
    }

    /// Insert or replace a single policy.
    pub fn insert(&mut self, policy: ProviderPolicy) {
        self.policies.insert(policy.provider.clone(), policy);
    }

    /// Find the policy for a provider, falling back to the generic default.
    pub fn resolve(&self, provider: &str) -> ProviderPolicy {
        let name = normalize_provider(provider);
        match self.policies.get(&name) {
            Some(policy) => policy.clone(),
            None => {
                debug!(provider = %name, "No policy for provider, using generic default");
                ProviderPolicy::generic(&name)
            }
        }
    }

    /// Names of all providers with an explicit policy, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_config(requests: i64, window: i64, burst: i64, burst_window: i64) -> PolicyConfig {
        PolicyConfig {
            requests_per_window: requests,
            window_duration_seconds: window,
            burst_limit: burst,
            burst_window_seconds: burst_window,
            adaptive_enabled: false,
        }
    }

    #[test]
    fn test_builtin_defaults() {
        let registry = PolicyRegistry::new();
        for provider in ["google", "microsoft", "apple", "caldav", "slack", "webhook"] {
            assert_eq!(registry.resolve(provider).provider, provider);
        }
        assert_eq!(registry.providers().len(), 6);
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let registry = PolicyRegistry::new();
        assert_eq!(registry.resolve("GOOGLE"), registry.resolve("google"));
        assert_eq!(registry.resolve("Microsoft").requests_per_window, 10_000);
    }

    #[test]
    fn test_unknown_provider_gets_generic_default() {
        let registry = PolicyRegistry::new();
        let policy = registry.resolve("zzz");

        assert_eq!(policy.provider, "zzz");
        assert_eq!(policy.requests_per_window, 100);
        assert_eq!(policy.window, Duration::from_secs(60));
        assert_eq!(policy.burst_limit, 10);
        assert_eq!(policy.burst_window, Duration::from_secs(10));
    }

    #[test]
    fn test_load_overrides_default() {
        let mut registry = PolicyRegistry::new();
        let overrides = HashMap::from([("Google".to_string(), policy_config(5, 60, 0, 10))]);
        registry.load(&overrides);

        let policy = registry.resolve("google");
        assert_eq!(policy.requests_per_window, 5);
        assert_eq!(policy.window, Duration::from_secs(60));
        assert!(!policy.has_burst());
    }

    #[test]
    fn test_load_adds_new_provider() {
        let mut registry = PolicyRegistry::new();
        let overrides = HashMap::from([("zoom".to_string(), policy_config(30, 1, 3, 1))]);
        registry.load(&overrides);

        let policy = registry.resolve("zoom");
        assert_eq!(policy.requests_per_window, 30);
        assert_eq!(policy.burst_limit, 3);
        assert_eq!(policy.burst_window, Duration::from_secs(1));
        assert!(registry.providers().contains(&"zoom".to_string()));
    }

    #[test]
    fn test_invalid_policies_fall_back_to_generic() {
        let mut registry = PolicyRegistry::new();
        let overrides = HashMap::from([
            ("google".to_string(), policy_config(100, 0, 0, 10)),
            ("microsoft".to_string(), policy_config(-1, 60, 0, 10)),
            ("apple".to_string(), policy_config(100, 60, -5, 10)),
            ("caldav".to_string(), policy_config(100, 60, 5, 0)),
        ]);
        registry.load(&overrides);

        for provider in ["google", "microsoft", "apple", "caldav"] {
            assert_eq!(registry.resolve(provider), ProviderPolicy::generic(provider));
        }
    }

    #[test]
    fn test_oversize_windows_fall_back_to_generic() {
        let mut registry = PolicyRegistry::new();
        let overrides = HashMap::from([
            ("google".to_string(), policy_config(1, i64::MAX, 0, 10)),
            ("slack".to_string(), policy_config(50, 60, 1, i64::MAX)),
        ]);
        registry.load(&overrides);

        assert_eq!(registry.resolve("google"), ProviderPolicy::generic("google"));
        assert_eq!(registry.resolve("slack"), ProviderPolicy::generic("slack"));
    }

    #[test]
    fn test_max_window_is_accepted() {
        let max = MAX_WINDOW.as_secs() as i64;
        let policy = policy_config(10, max, 2, max).to_policy("google").unwrap();
        assert_eq!(policy.window, MAX_WINDOW);
        assert_eq!(policy.burst_window, MAX_WINDOW);

        let err = policy_config(10, max + 1, 0, 10).to_policy("google").unwrap_err();
        assert!(matches!(err, QuotaGuardError::InvalidPolicy { .. }));
    }

    #[test]
    fn test_zero_burst_ignores_burst_window() {
        let policy = policy_config(10, 60, 0, -1).to_policy("x").unwrap();
        assert!(!policy.has_burst());
    }

    #[test]
    fn test_to_policy_reports_reason() {
        let err = policy_config(10, -60, 0, 10).to_policy("google").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("google"));
        assert!(message.contains("window_duration_seconds"));
    }

    #[test]
    fn test_parse_policy_config_yaml() {
        let yaml = r#"
requests_per_window: 5
window_duration_seconds: 60
"#;
        let config: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config, policy_config(5, 60, 0, 10));
    }

    #[test]
    fn test_empty_registry() {
        let registry = PolicyRegistry::empty();
        assert!(registry.providers().is_empty());
        assert_eq!(registry.resolve("google"), ProviderPolicy::generic("google"));
    }
}
