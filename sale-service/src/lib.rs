pub mod api;
pub mod broadcaster;
pub mod config;
pub mod coordinator;
pub mod rate_limiter;

pub use broadcaster::{BroadcasterConfig, SaleStateBroadcaster, Subscription};
pub use coordinator::{AdmissionOutcome, SaleCoordinator};
pub use rate_limiter::{RateDecision, RateLimitConfig, RateLimiter};
