//! Periodic status logging for the admission layer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::controller::{AdmissionController, TelemetryReport};

/// Periodically logs the telemetry of an [`AdmissionController`].
pub struct StatusReporter {
    controller: Arc<AdmissionController>,
    interval: Duration,
}

impl StatusReporter {
    /// A zero `interval` disables periodic reports.
    pub fn new(controller: Arc<AdmissionController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Log one report and return it.
    pub fn report_once(&self) -> TelemetryReport {
        let report = self.controller.telemetry();

        match serde_json::to_string(&report) {
            Ok(json) => info!(
                rate_limiters = report.rate_limiters.len(),
                circuit_breakers = report.circuit_breakers.len(),
                report = %json,
                "Status report"
            ),
            Err(e) => error!(error = %e, "Failed to serialize status report"),
        }

        let open = self.controller.circuit_breakers().open_circuits();
        if !open.is_empty() {
            warn!(circuits = ?open, "Open circuits detected");
        }

        report
    }

    /// Report on every tick until `shutdown` resolves. Returns the number of reports logged.
    pub async fn run_until<S>(self, shutdown: S) -> usize
    where
        S: Future<Output = ()>,
    {
        if self.interval.is_zero() {
            info!("Status reporting disabled");
            shutdown.await;
            return 0;
        }

        info!(interval_secs = self.interval.as_secs_f64(), "Status reporter started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        tokio::pin!(shutdown);
        let mut reports = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(reports, "Status reporter stopped");
                    return reports;
                }
                _ = ticker.tick() => {
                    self.report_once();
                    reports += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Admission;
    use crate::breaker::CircuitBreakerRegistry;
    use crate::ratelimit::RateLimiterRegistry;

    fn controller() -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(
            Arc::new(RateLimiterRegistry::new()),
            Arc::new(CircuitBreakerRegistry::with_defaults(1, Duration::from_secs(30))),
        ))
    }

    #[test]
    fn test_report_once_reflects_registries() {
        let controller = controller();
        if let Admission::Admitted(permit) = controller.admit("orders") {
            permit.failure();
        }

        let reporter = StatusReporter::new(Arc::clone(&controller), Duration::from_secs(1));
        let report = reporter.report_once();

        assert_eq!(report.rate_limiters.get("orders").unwrap().remaining, 99);
        assert_eq!(report.circuit_breakers.get("orders").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_disabled_reporter_waits_for_shutdown() {
        let reporter = StatusReporter::new(controller(), Duration::ZERO);
        let reports = reporter.run_until(async {}).await;
        assert_eq!(reports, 0);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let reporter = StatusReporter::new(controller(), Duration::from_millis(10));
        let reports = reporter
            .run_until(tokio::time::sleep(Duration::from_millis(55)))
            .await;
        assert!(reports >= 1, "expected at least one report, got {}", reports);
    }
}
