//! Circuit breaking for downstream calls.

mod circuit;
mod registry;

pub use circuit::{CallKind, CircuitBreaker, CircuitBreakerStatus, CircuitState};
pub use registry::{CircuitBreakerRegistry, DEFAULT_THRESHOLD, DEFAULT_TIMEOUT};
