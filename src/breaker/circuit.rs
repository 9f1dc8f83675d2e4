//! Consecutive-failure circuit breaker.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::clock::{system_clock, SharedClock};

/// The state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the recovery timeout elapses
    Open,
    /// A single probe call is testing the downstream
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an admitted call relates to the breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Admitted while closed
    Normal,
    /// The single trial call of a half-open breaker, tagged with its generation
    Probe(u64),
}

impl CallKind {
    pub fn is_probe(&self) -> bool {
        matches!(self, CallKind::Probe(_))
    }
}

/// Snapshot of a breaker for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Failures that open the circuit
    pub threshold: u32,
    /// Recovery timeout in seconds
    pub timeout: f64,
    /// Seconds since the last recorded failure, if any
    pub last_failure: Option<f64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    /// Generation of the probe holding the half-open slot
    probe_in_flight: Option<u64>,
    /// Incremented for every probe handed out
    probe_generation: u64,
}

impl BreakerState {
    fn start_probe(&mut self) -> CallKind {
        self.probe_generation = self.probe_generation.wrapping_add(1);
        self.probe_in_flight = Some(self.probe_generation);
        CallKind::Probe(self.probe_generation)
    }

    fn is_current_probe(&self, generation: u64) -> bool {
        self.state == CircuitState::HalfOpen && self.probe_in_flight == Some(generation)
    }
}

/// Stops calls to a downstream after `failure_threshold` consecutive
/// failures, then lets exactly one probe through once `recovery_timeout`
/// has elapsed.
///
/// ```text
/// Closed   --threshold failures-->  Open
/// Open     --timeout elapsed----->  HalfOpen   (evaluated on allow_request)
/// HalfOpen --probe succeeds------>  Closed
/// HalfOpen --probe fails--------->  Open
/// ```
///
/// A caller admitted by [`allow_request`](Self::allow_request) is expected
/// to report back with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). A probe that ends without
/// either must call [`release_probe`](Self::release_probe), otherwise the
/// breaker stays half-open with its probe slot taken. Callers holding a
/// [`CallKind`] from [`try_acquire`](Self::try_acquire) report through
/// [`record_outcome`](Self::record_outcome) instead, which ignores calls
/// admitted before the breaker last changed state.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: Mutex<BreakerState>,
    clock: SharedClock,
}

impl CircuitBreaker {
    /// Create a breaker reading the system clock.
    ///
    /// A threshold of zero behaves as one.
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self::with_clock(name, failure_threshold, recovery_timeout, system_clock())
    }

    /// Create a breaker reading the given clock.
    pub fn with_clock(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        clock: SharedClock,
    ) -> Self {
        let name = name.into();
        info!(
            breaker = %name,
            threshold = failure_threshold,
            timeout_secs = recovery_timeout.as_secs_f64(),
            "Circuit breaker initialized"
        );

        Self {
            name,
            failure_threshold,
            recovery_timeout,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                last_failure_at: None,
                probe_in_flight: None,
                probe_generation: 0,
            }),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Decide whether a call may proceed.
    pub fn allow_request(&self) -> bool {
        self.try_acquire().is_some()
    }

    /// Like [`allow_request`](Self::allow_request), but says whether the
    /// admitted call is the half-open probe.
    ///
    /// Report a call acquired this way with
    /// [`record_outcome`](Self::record_outcome) so that only the current
    /// probe can close or reopen a half-open breaker.
    pub fn try_acquire(&self) -> Option<CallKind> {
        let now = self.clock.now();
        let mut inner = self.state.lock();

        match inner.state {
            CircuitState::Closed => Some(CallKind::Normal),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened) >= self.recovery_timeout)
                    .unwrap_or(true);

                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    info!(breaker = %self.name, "Circuit breaker transitioning from OPEN to HALF_OPEN");
                    Some(inner.start_probe())
                } else {
                    debug!(breaker = %self.name, "Circuit open, rejecting call");
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight.is_some() {
                    debug!(breaker = %self.name, "Probe already in flight, rejecting call");
                    None
                } else {
                    Some(inner.start_probe())
                }
            }
        }
    }

    /// Record that an admitted call succeeded.
    ///
    /// Applies to whichever call is in flight; a half-open breaker closes.
    pub fn record_success(&self) {
        let mut inner = self.state.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => self.close(&mut inner),
            CircuitState::Open => {
                debug!(breaker = %self.name, "Ignoring success reported while circuit is open");
            }
        }
    }

    /// Record that an admitted call failed.
    ///
    /// Applies to whichever call is in flight; a half-open breaker reopens.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.state.lock();
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed => self.count_failure(&mut inner, now),
            CircuitState::HalfOpen => self.reopen(&mut inner, now),
            CircuitState::Open => {}
        }
    }

    /// Record the outcome of a call admitted by [`try_acquire`](Self::try_acquire).
    ///
    /// A normal call only affects a closed breaker. A probe only affects the
    /// breaker while it is still the current probe.
    pub fn record_outcome(&self, kind: CallKind, succeeded: bool) {
        let now = self.clock.now();
        let mut inner = self.state.lock();
        if !succeeded {
            inner.last_failure_at = Some(now);
        }

        match kind {
            CallKind::Normal if inner.state == CircuitState::Closed => {
                if succeeded {
                    inner.failure_count = 0;
                } else {
                    self.count_failure(&mut inner, now);
                }
            }
            CallKind::Probe(generation) if inner.is_current_probe(generation) => {
                if succeeded {
                    self.close(&mut inner);
                } else {
                    self.reopen(&mut inner, now);
                }
            }
            _ => {
                debug!(
                    breaker = %self.name,
                    state = %inner.state,
                    succeeded,
                    "Ignoring outcome of call admitted under an earlier state"
                );
            }
        }
    }

    /// Free the probe slot taken by `kind` when that call ended without an outcome.
    ///
    /// Does nothing for normal calls or for a probe that no longer holds the slot.
    pub fn release_probe(&self, kind: CallKind) {
        let CallKind::Probe(generation) = kind else {
            return;
        };

        let mut inner = self.state.lock();
        if inner.is_current_probe(generation) {
            inner.probe_in_flight = None;
            debug!(breaker = %self.name, "Probe released without outcome");
        }
    }

    /// Force the breaker back to closed with a clean failure streak.
    pub fn reset(&self) {
        let mut inner = self.state.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probe_in_flight = None;
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    fn count_failure(&self, inner: &mut BreakerState, now: Instant) {
        inner.failure_count = inner.failure_count.saturating_add(1);
        if inner.failure_count >= self.failure_threshold.max(1) {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                "Circuit breaker transitioning from CLOSED to OPEN"
            );
        }
    }

    fn close(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probe_in_flight = None;
        info!(breaker = %self.name, "Circuit breaker transitioning from HALF_OPEN to CLOSED");
    }

    fn reopen(&self, inner: &mut BreakerState, now: Instant) {
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.probe_in_flight = None;
        warn!(breaker = %self.name, "Circuit breaker transitioning from HALF_OPEN to OPEN");
    }

    /// Current state, without evaluating the recovery timeout.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Status snapshot. Never triggers a state transition.
    pub fn status(&self) -> CircuitBreakerStatus {
        let now = self.clock.now();
        let inner = self.state.lock();

        CircuitBreakerStatus {
            state: inner.state,
            failure_count: inner.failure_count,
            threshold: self.failure_threshold,
            timeout: self.recovery_timeout.as_secs_f64(),
            last_failure: inner
                .last_failure_at
                .map(|at| now.saturating_duration_since(at).as_secs_f64()),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .field("state", &*self.state.lock())
            .finish()
    }
}
