//! Error types for quotaguard.

use thiserror::Error;

/// Main error type for quotaguard operations.
///
/// None of these escape the admission path of [`crate::ratelimit::RateLimiter`];
/// they are logged there and converted into a permissive decision or a no-op.
#[derive(Error, Debug)]
pub enum QuotaGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A provider policy that cannot be enforced
    #[error("Invalid policy for provider '{provider}': {reason}")]
    InvalidPolicy { provider: String, reason: String },

    /// A caller key that cannot address a window store
    #[error("Invalid caller key: {0}")]
    InvalidKey(String),

    /// Unexpected state while computing occupancy
    #[error("Internal fault: {0}")]
    InternalFault(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Layered configuration source errors
    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),
}

/// Result type alias for quotaguard operations.
pub type Result<T> = std::result::Result<T, QuotaGuardError>;
