//! Sliding-window rate limiting and limiter registration.

mod registry;
mod window;

pub use registry::{RateLimiterRegistry, DEFAULT_REQUESTS, DEFAULT_WINDOW};
pub use window::{RateLimitDecision, RateLimiterStatus, SlidingWindowLimiter};
