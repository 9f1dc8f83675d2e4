//! Meshguard - Service Mesh Admission Control
//!
//! This crate implements the per-service admission layer of a service mesh
//! proxy. Each named upstream service gets a sliding-window rate limiter and
//! a circuit breaker, created on first use and shared by every caller.

pub mod admission;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod ratelimit;
pub mod status;

mod registry;

pub use admission::{Admission, AdmissionController, AdmissionError, Permit, StatusReporter};
pub use breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use config::MeshGuardConfig;
pub use error::{MeshGuardError, Result};
pub use ratelimit::{RateLimitDecision, RateLimiterRegistry, SlidingWindowLimiter};
