//! Lookup-or-create registry of circuit breakers keyed by downstream name.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::circuit::{CircuitBreaker, CircuitBreakerStatus, CircuitState};
use crate::clock::{system_clock, SharedClock};
use crate::error::{MeshGuardError, Result};
use crate::registry::NamedRegistry;
use crate::status::StatusReport;

/// Default consecutive failures that open a circuit.
pub const DEFAULT_THRESHOLD: u32 = 5;
/// Default time an open circuit waits before probing.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns every circuit breaker in the process.
///
/// Same lifecycle and first-registration rules as
/// [`RateLimiterRegistry`](crate::ratelimit::RateLimiterRegistry).
pub struct CircuitBreakerRegistry {
    breakers: NamedRegistry<CircuitBreaker>,
    default_threshold: u32,
    default_timeout: Duration,
    clock: SharedClock,
}

impl CircuitBreakerRegistry {
    /// Create a registry with the stock defaults (5 failures, 30 second cooldown).
    pub fn new() -> Self {
        Self::with_defaults(DEFAULT_THRESHOLD, DEFAULT_TIMEOUT)
    }

    pub fn with_defaults(threshold: u32, timeout: Duration) -> Self {
        info!(
            default_threshold = threshold,
            default_timeout_secs = timeout.as_secs_f64(),
            "Circuit breaker registry initialized"
        );
        Self {
            breakers: NamedRegistry::new(),
            default_threshold: threshold,
            default_timeout: timeout,
            clock: system_clock(),
        }
    }

    /// Use `clock` for every breaker created from now on.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_threshold(&self) -> u32 {
        self.default_threshold
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Return the breaker for `name`, creating it with `threshold`/`timeout` if absent.
    ///
    /// Parameters passed for an existing name are ignored and a mismatch is
    /// logged at `warn`.
    pub fn get_circuit_breaker(
        &self,
        name: &str,
        threshold: u32,
        timeout: Duration,
    ) -> Arc<CircuitBreaker> {
        let (breaker, created) = self.get_or_create(name, threshold, timeout);
        if !created && !Self::matches(&breaker, threshold, timeout) {
            warn!(
                breaker = %name,
                requested_threshold = threshold,
                requested_timeout_secs = timeout.as_secs_f64(),
                active_threshold = breaker.failure_threshold(),
                active_timeout_secs = breaker.recovery_timeout().as_secs_f64(),
                "Ignoring parameters for already registered circuit breaker"
            );
        }
        breaker
    }

    /// Return the breaker for `name`, creating it with the registry defaults.
    pub fn get_or_default(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.default_threshold, self.default_timeout)
            .0
    }

    /// Register `name` explicitly, failing on conflicting parameters.
    pub fn register(
        &self,
        name: &str,
        threshold: u32,
        timeout: Duration,
    ) -> Result<Arc<CircuitBreaker>> {
        let (breaker, created) = self.get_or_create(name, threshold, timeout);
        if created || Self::matches(&breaker, threshold, timeout) {
            return Ok(breaker);
        }

        Err(MeshGuardError::Conflict {
            name: name.to_string(),
            detail: format!(
                "registered with threshold {} and timeout {:?}, requested {} and {:?}",
                breaker.failure_threshold(),
                breaker.recovery_timeout(),
                threshold,
                timeout
            ),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers.names()
    }

    /// Names of breakers currently open, in registration order.
    pub fn open_circuits(&self) -> Vec<String> {
        self.breakers
            .snapshot()
            .into_iter()
            .filter(|(_, breaker)| breaker.state() == CircuitState::Open)
            .map(|(name, _)| name)
            .collect()
    }

    /// Close every breaker.
    pub fn reset_all(&self) {
        let breakers = self.breakers.snapshot();
        for (_, breaker) in &breakers {
            breaker.reset();
        }
        info!(count = breakers.len(), "All circuit breakers reset");
    }

    /// Status of every breaker in registration order.
    pub fn get_status(&self) -> StatusReport<CircuitBreakerStatus> {
        self.breakers
            .snapshot()
            .into_iter()
            .map(|(name, breaker)| (name, breaker.status()))
            .collect()
    }

    fn get_or_create(
        &self,
        name: &str,
        threshold: u32,
        timeout: Duration,
    ) -> (Arc<CircuitBreaker>, bool) {
        let (breaker, created) = self.breakers.get_or_insert_with(name, || {
            CircuitBreaker::with_clock(name, threshold, timeout, Arc::clone(&self.clock))
        });
        if created {
            debug!(breaker = %name, total = self.breakers.len(), "Registered circuit breaker");
        }
        (breaker, created)
    }

    fn matches(breaker: &CircuitBreaker, threshold: u32, timeout: Duration) -> bool {
        breaker.failure_threshold() == threshold && breaker.recovery_timeout() == timeout
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
