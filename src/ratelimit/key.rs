//! Composite key generation for window stores.

use crate::error::{QuotaGuardError, Result};

/// A key that uniquely identifies one quota bucket.
///
/// The provider name is normalised so that `Google` and `google` share a bucket;
/// the caller key is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    /// The provider this bucket is charged against
    pub provider: String,
    /// The caller identifier (tenant, user, account...)
    pub key: String,
}

impl StoreKey {
    /// Create a new store key from a caller key and provider.
    pub fn new(key: &str, provider: &str) -> Result<Self> {
        if key.is_empty() {
            return Err(QuotaGuardError::InvalidKey(format!(
                "empty caller key for provider '{}'",
                provider
            )));
        }

        Ok(Self {
            provider: normalize_provider(provider),
            key: key.to_string(),
        })
    }

    /// Convert the store key to its composite string representation.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.provider, self.key)
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Canonical form of a provider name used for policy lookup and bucketing.
pub(crate) fn normalize_provider(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}
