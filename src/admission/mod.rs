//! Request admission for service-to-service calls.

mod controller;
mod reporter;

pub use controller::{
    Admission, AdmissionController, AdmissionError, Features, HealthReport, HealthStatus, Permit,
    TelemetryReport,
};
pub use reporter::StatusReporter;
