//! Rate limiting logic and state management.

mod backend;
mod clock;
mod janitor;
mod key;
mod limiter;
mod policy;
mod stats;
mod window;

pub use backend::RateLimiterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use janitor::{Janitor, JanitorHandle};
pub use key::StoreKey;
pub use limiter::{Decision, DenyReason, RateLimiter};
pub use policy::{PolicyConfig, PolicyRegistry, ProviderPolicy, MAX_WINDOW};
pub use stats::{ProviderStatistics, StoreSnapshot, ALL_PROVIDERS};
pub use window::{Reclaimed, RequestRecord, WindowStore, DEFAULT_IDLE_GRACE, HIGH_WATER_MARK};
