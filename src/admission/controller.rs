//! Composition of rate limiting and circuit breaking for one service call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::breaker::{CallKind, CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStatus};
use crate::clock::{system_clock, SharedClock};
use crate::config::MeshGuardConfig;
use crate::error::Result;
use crate::ratelimit::{RateLimitDecision, RateLimiterRegistry, RateLimiterStatus};
use crate::status::StatusReport;

/// Result of asking whether a call to a service may proceed.
#[derive(Debug)]
pub enum Admission {
    /// The call may proceed; report its outcome on the permit
    Admitted(Permit),
    /// The service's rate limit is exhausted (HTTP 429)
    RateLimited(RateLimitDecision),
    /// The service's circuit is open or its probe slot is taken (HTTP 503)
    CircuitOpen,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    /// HTTP status a proxy should answer with when the call is rejected.
    pub fn rejection_status(&self) -> Option<u16> {
        match self {
            Admission::Admitted(_) => None,
            Admission::RateLimited(_) => Some(429),
            Admission::CircuitOpen => Some(503),
        }
    }
}

/// Handle for an admitted call.
///
/// Consuming it with [`success`](Self::success) or [`failure`](Self::failure)
/// feeds the circuit breaker. An outcome reported after the breaker has left
/// the state this call was admitted under is ignored. Dropping it without an
/// outcome frees the probe slot if this call still holds it.
#[must_use = "report the call outcome with success() or failure()"]
pub struct Permit {
    service: String,
    breaker: Option<(Arc<CircuitBreaker>, CallKind)>,
}

impl Permit {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether this call is the probe of a half-open breaker.
    pub fn is_probe(&self) -> bool {
        matches!(self.breaker, Some((_, kind)) if kind.is_probe())
    }

    pub fn success(mut self) {
        if let Some((breaker, kind)) = self.breaker.take() {
            breaker.record_outcome(kind, true);
        }
    }

    pub fn failure(mut self) {
        if let Some((breaker, kind)) = self.breaker.take() {
            breaker.record_outcome(kind, false);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some((breaker, kind)) = self.breaker.take() {
            breaker.release_probe(kind);
        }
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("service", &self.service)
            .field("probe", &self.is_probe())
            .finish()
    }
}

/// Why [`AdmissionController::run`] did not return the call's value.
#[derive(Debug, Error)]
pub enum AdmissionError<E> {
    #[error("rate limit exceeded for '{service}', retry after {}s", .decision.reset_after_secs())]
    RateLimited {
        service: String,
        decision: RateLimitDecision,
    },

    #[error("circuit open for '{service}'")]
    CircuitOpen { service: String },

    #[error("downstream call failed: {0}")]
    Downstream(E),
}

impl<E> AdmissionError<E> {
    /// HTTP status a proxy should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            AdmissionError::RateLimited { .. } => 429,
            AdmissionError::CircuitOpen { .. } => 503,
            AdmissionError::Downstream(_) => 500,
        }
    }
}

/// Which admission stages are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Features {
    pub rate_limit_enabled: bool,
    pub circuit_breaker_enabled: bool,
}

/// Overall health of the admission layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// At least one circuit is open
    Degraded,
}

/// Summary for a `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service: &'static str,
    pub version: &'static str,
    pub instance_id: Uuid,
    pub features: Features,
    pub rate_limiters: usize,
    pub circuit_breakers: usize,
    pub open_circuits: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Full status for a `/telemetry` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryReport {
    pub generated_at: DateTime<Utc>,
    pub rate_limiters: StatusReport<RateLimiterStatus>,
    pub circuit_breakers: StatusReport<CircuitBreakerStatus>,
}

/// Decides whether calls to a named service may proceed.
///
/// The rate limiter is consulted first; a rate-limited call never reaches
/// the circuit breaker. Limiters and breakers for unknown names are created
/// with the registry defaults on first use.
pub struct AdmissionController {
    rate_limiters: Arc<RateLimiterRegistry>,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    features: Features,
    instance_id: Uuid,
}

impl AdmissionController {
    /// Create a controller over existing registries with both stages enabled.
    pub fn new(
        rate_limiters: Arc<RateLimiterRegistry>,
        circuit_breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            rate_limiters,
            circuit_breakers,
            features: Features {
                rate_limit_enabled: true,
                circuit_breaker_enabled: true,
            },
            instance_id: Uuid::new_v4(),
        }
    }

    /// Build registries from configuration and register every configured service.
    pub fn from_config(config: &MeshGuardConfig) -> Result<Self> {
        Self::from_config_with_clock(config, system_clock())
    }

    /// As [`from_config`](Self::from_config), reading time from `clock`.
    pub fn from_config_with_clock(config: &MeshGuardConfig, clock: SharedClock) -> Result<Self> {
        let rate_limiters =
            RateLimiterRegistry::with_defaults(config.rate_limit.requests, config.rate_limit.window())
                .with_clock(Arc::clone(&clock));
        let circuit_breakers = CircuitBreakerRegistry::with_defaults(
            config.circuit_breaker.threshold,
            config.circuit_breaker.timeout(),
        )
        .with_clock(clock);

        for service in &config.services {
            let (requests, window) = service.rate_limit_for(&config.rate_limit);
            rate_limiters.register(&service.name, requests, window)?;

            let (threshold, timeout) = service.circuit_breaker_for(&config.circuit_breaker);
            circuit_breakers.register(&service.name, threshold, timeout)?;
        }

        info!(
            services = config.services.len(),
            rate_limit_enabled = config.rate_limit.enabled,
            circuit_breaker_enabled = config.circuit_breaker.enabled,
            "Admission controller initialized"
        );

        Ok(Self::new(Arc::new(rate_limiters), Arc::new(circuit_breakers))
            .with_rate_limiting(config.rate_limit.enabled)
            .with_circuit_breaking(config.circuit_breaker.enabled))
    }

    pub fn with_rate_limiting(mut self, enabled: bool) -> Self {
        self.features.rate_limit_enabled = enabled;
        self
    }

    pub fn with_circuit_breaking(mut self, enabled: bool) -> Self {
        self.features.circuit_breaker_enabled = enabled;
        self
    }

    pub fn rate_limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.rate_limiters
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuit_breakers
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Decide whether a call to `service` may proceed.
    pub fn admit(&self, service: &str) -> Admission {
        if self.features.rate_limit_enabled {
            let decision = self.rate_limiters.get_or_default(service).check();
            if !decision.allowed {
                debug!(
                    service = %service,
                    limit = decision.limit,
                    reset_secs = decision.reset_after_secs(),
                    "Rate limit exceeded"
                );
                return Admission::RateLimited(decision);
            }
        }

        let breaker = if self.features.circuit_breaker_enabled {
            let breaker = self.circuit_breakers.get_or_default(service);
            match breaker.try_acquire() {
                Some(kind) => Some((breaker, kind)),
                None => {
                    debug!(service = %service, state = %breaker.state(), "Circuit breaker open");
                    return Admission::CircuitOpen;
                }
            }
        } else {
            None
        };

        debug!(service = %service, "Call admitted");
        Admission::Admitted(Permit {
            service: service.to_string(),
            breaker,
        })
    }

    /// Admit a call to `service`, run it, and record its outcome.
    ///
    /// If the returned future is dropped before `call` completes, nothing is
    /// recorded and a held probe slot is released.
    pub async fn run<F, T, E>(&self, service: &str, call: F) -> std::result::Result<T, AdmissionError<E>>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        let permit = match self.admit(service) {
            Admission::Admitted(permit) => permit,
            Admission::RateLimited(decision) => {
                return Err(AdmissionError::RateLimited {
                    service: service.to_string(),
                    decision,
                })
            }
            Admission::CircuitOpen => {
                return Err(AdmissionError::CircuitOpen {
                    service: service.to_string(),
                })
            }
        };

        match call.await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(AdmissionError::Downstream(err))
            }
        }
    }

    /// Health summary. Has no admission side effects.
    pub fn health(&self) -> HealthReport {
        let open_circuits = self.circuit_breakers.open_circuits();
        let status = if open_circuits.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            instance_id: self.instance_id,
            features: self.features,
            rate_limiters: self.rate_limiters.len(),
            circuit_breakers: self.circuit_breakers.len(),
            open_circuits,
            generated_at: Utc::now(),
        }
    }

    /// Status of every limiter and breaker. Has no admission side effects.
    pub fn telemetry(&self) -> TelemetryReport {
        TelemetryReport {
            generated_at: Utc::now(),
            rate_limiters: self.rate_limiters.get_status(),
            circuit_breakers: self.circuit_breakers.get_status(),
        }
    }

    /// Clear every limiter and close every breaker.
    pub fn reset_all(&self) {
        self.rate_limiters.reset_all();
        self.circuit_breakers.reset_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::clock::ManualClock;
    use crate::config::{ServiceCircuitBreaker, ServiceConfig, ServiceRateLimit};
    use std::time::Duration;

    fn controller(yaml: &str) -> (AdmissionController, ManualClock) {
        let clock = ManualClock::new();
        let config = MeshGuardConfig::from_yaml(yaml).unwrap();
        let controller =
            AdmissionController::from_config_with_clock(&config, Arc::new(clock.clone())).unwrap();
        (controller, clock)
    }

    #[test]
    fn test_admits_and_records_success() {
        let (controller, _clock) = controller("{}");

        match controller.admit("orders") {
            Admission::Admitted(permit) => {
                assert_eq!(permit.service(), "orders");
                assert!(!permit.is_probe());
                permit.success();
            }
            other => panic!("expected admission, got {:?}", other),
        }

        assert_eq!(controller.rate_limiters().len(), 1);
        assert_eq!(controller.circuit_breakers().len(), 1);
    }

    #[test]
    fn test_rate_limited_call_skips_breaker() {
        let (controller, _clock) = controller(
            "services:\n  - name: orders\n    rate_limit: { requests: 1 }\n    circuit_breaker: { threshold: 1 }\n",
        );

        if let Admission::Admitted(permit) = controller.admit("orders") {
            permit.success();
        }

        let rejected = controller.admit("orders");
        assert_eq!(rejected.rejection_status(), Some(429));
        match rejected {
            Admission::RateLimited(decision) => {
                assert_eq!(decision.limit, 1);
                assert_eq!(decision.remaining, 0);
                assert_eq!(decision.reset_after_secs(), 60);
            }
            other => panic!("expected rate limit, got {:?}", other),
        }

        let breaker = controller.circuit_breakers().get("orders").unwrap();
        assert!(breaker.is_closed());
    }

    #[test]
    fn test_open_circuit_rejects_with_503() {
        let (controller, clock) = controller(
            "services:\n  - name: orders\n    circuit_breaker: { threshold: 2, timeout_secs: 5 }\n",
        );

        for _ in 0..2 {
            match controller.admit("orders") {
                Admission::Admitted(permit) => permit.failure(),
                other => panic!("expected admission, got {:?}", other),
            }
        }

        let rejected = controller.admit("orders");
        assert_eq!(rejected.rejection_status(), Some(503));

        clock.advance_secs(5);
        match controller.admit("orders") {
            Admission::Admitted(permit) => {
                assert!(permit.is_probe());
                // Probe slot is taken while this permit is alive
                assert!(matches!(controller.admit("orders"), Admission::CircuitOpen));
                permit.success();
            }
            other => panic!("expected probe, got {:?}", other),
        }

        let breaker = controller.circuit_breakers().get("orders").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_probe_permit_releases_slot() {
        let (controller, clock) =
            controller("circuit_breaker: { threshold: 1, timeout_secs: 5 }\n");

        if let Admission::Admitted(permit) = controller.admit("orders") {
            permit.failure();
        }
        clock.advance_secs(5);

        let probe = controller.admit("orders");
        assert!(probe.is_admitted());
        drop(probe);

        assert!(controller.admit("orders").is_admitted());
    }

    fn admitted(admission: Admission) -> Permit {
        match admission {
            Admission::Admitted(permit) => permit,
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[test]
    fn test_late_success_does_not_close_half_open() {
        let (controller, clock) =
            controller("circuit_breaker: { threshold: 2, timeout_secs: 5 }\n");

        let late = admitted(controller.admit("orders"));
        admitted(controller.admit("orders")).failure();
        admitted(controller.admit("orders")).failure();
        clock.advance_secs(5);

        let probe = admitted(controller.admit("orders"));
        assert!(probe.is_probe());

        late.success();
        let breaker = controller.circuit_breakers().get("orders").unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(controller.admit("orders"), Admission::CircuitOpen));

        probe.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_late_failure_keeps_probe_slot() {
        let (controller, clock) =
            controller("circuit_breaker: { threshold: 1, timeout_secs: 5 }\n");

        let late = admitted(controller.admit("orders"));
        admitted(controller.admit("orders")).failure();
        clock.advance_secs(5);
        let first = admitted(controller.admit("orders"));

        late.failure();
        clock.advance_secs(5);
        assert!(matches!(controller.admit("orders"), Admission::CircuitOpen));

        drop(first);
        let second = admitted(controller.admit("orders"));
        assert!(second.is_probe());
        assert!(matches!(controller.admit("orders"), Admission::CircuitOpen));
    }

    #[test]
    fn test_dropping_earlier_probe_keeps_later_probe_slot() {
        let (controller, clock) =
            controller("circuit_breaker: { threshold: 1, timeout_secs: 5 }\n");
        let breaker = controller.circuit_breakers().get_or_default("orders");

        breaker.record_failure();
        clock.advance_secs(5);
        let first = admitted(controller.admit("orders"));

        // Reported outside any permit, reopening the circuit under the first probe
        breaker.record_failure();
        clock.advance_secs(5);
        let second = admitted(controller.admit("orders"));
        assert!(second.is_probe());

        drop(first);
        assert!(matches!(controller.admit("orders"), Admission::CircuitOpen));

        second.success();
        assert!(breaker.is_closed());
    }

    #[test]
    fn test_disabled_stages_always_admit() {
        let (controller, _clock) = controller(
            "rate_limit: { enabled: false, requests: 0 }\ncircuit_breaker: { enabled: false }\n",
        );

        for _ in 0..10 {
            match controller.admit("orders") {
                Admission::Admitted(permit) => permit.failure(),
                other => panic!("expected admission, got {:?}", other),
            }
        }

        assert!(controller.rate_limiters().is_empty());
        assert!(controller.circuit_breakers().is_empty());
    }

    #[test]
    fn test_configured_services_are_preregistered() {
        let mut config = MeshGuardConfig::default();
        let mut orders = ServiceConfig::new("orders");
        orders.rate_limit = Some(ServiceRateLimit {
            requests: Some(10),
            window_secs: None,
        });
        orders.circuit_breaker = Some(ServiceCircuitBreaker {
            threshold: Some(2),
            timeout_secs: Some(15),
        });
        config.services.push(orders);
        config.services.push(ServiceConfig::new("users"));

        let controller = AdmissionController::from_config(&config).unwrap();

        assert_eq!(controller.rate_limiters().names(), vec!["orders", "users"]);
        let orders_limiter = controller.rate_limiters().get("orders").unwrap();
        assert_eq!(orders_limiter.limit(), 10);
        assert_eq!(orders_limiter.window(), Duration::from_secs(60));

        let orders_breaker = controller.circuit_breakers().get("orders").unwrap();
        assert_eq!(orders_breaker.failure_threshold(), 2);
        assert_eq!(orders_breaker.recovery_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_health_reports_degraded_when_circuit_open() {
        let (controller, _clock) = controller("circuit_breaker: { threshold: 1 }\n");
        assert_eq!(controller.health().status, HealthStatus::Healthy);

        if let Admission::Admitted(permit) = controller.admit("orders") {
            permit.failure();
        }

        let health = controller.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.open_circuits, vec!["orders".to_string()]);
        assert_eq!(health.rate_limiters, 1);
        assert_eq!(health.circuit_breakers, 1);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["features"]["rate_limit_enabled"], true);
        assert_eq!(json["service"], "meshguard");
    }

    #[test]
    fn test_telemetry_does_not_consume_quota() {
        let (controller, _clock) =
            controller("services:\n  - name: orders\n    rate_limit: { requests: 2 }\n");

        for _ in 0..3 {
            controller.telemetry();
        }

        let report = controller.telemetry();
        assert_eq!(report.rate_limiters.get("orders").unwrap().remaining, 2);
        assert_eq!(
            report.circuit_breakers.get("orders").unwrap().state,
            CircuitState::Closed
        );

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["rate_limiters"]["orders"]["requests"], 2);
    }

    #[test]
    fn test_reset_all_restores_both_stages() {
        let (controller, _clock) = controller(
            "rate_limit: { requests: 1 }\ncircuit_breaker: { threshold: 1 }\n",
        );

        if let Admission::Admitted(permit) = controller.admit("orders") {
            permit.failure();
        }
        assert!(!controller.admit("orders").is_admitted());

        controller.reset_all();
        assert!(controller.admit("orders").is_admitted());
    }

    #[tokio::test]
    async fn test_run_records_outcomes() {
        let (controller, _clock) = controller("circuit_breaker: { threshold: 2 }\n");

        let ok: std::result::Result<u32, AdmissionError<String>> =
            controller.run("orders", async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        for _ in 0..2 {
            let err = controller
                .run("orders", async { Err::<u32, _>("boom".to_string()) })
                .await
                .unwrap_err();
            assert_eq!(err.status_code(), 500);
        }

        let rejected = controller
            .run("orders", async { Ok::<u32, String>(1) })
            .await
            .unwrap_err();
        assert!(matches!(rejected, AdmissionError::CircuitOpen { ref service } if service == "orders"));
        assert_eq!(rejected.status_code(), 503);
        assert_eq!(rejected.to_string(), "circuit open for 'orders'");
    }

    #[tokio::test]
    async fn test_run_reports_rate_limit() {
        let (controller, _clock) = controller("rate_limit: { requests: 1, window_secs: 10 }\n");

        controller
            .run("orders", async { Ok::<(), String>(()) })
            .await
            .unwrap();

        let err = controller
            .run("orders", async { Ok::<(), String>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert_eq!(
            err.to_string(),
            "rate limit exceeded for 'orders', retry after 10s"
        );
    }
}
