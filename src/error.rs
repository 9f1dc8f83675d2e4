//! Error types for the Meshguard service.

use thiserror::Error;

/// Main error type for Meshguard operations.
///
/// Admission decisions themselves are never errors; a rejected request is an
/// ordinary return value. These variants cover setup and registration.
#[derive(Error, Debug)]
pub enum MeshGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A name was explicitly registered twice with different parameters
    #[error("Conflicting registration for '{name}': {detail}")]
    Conflict { name: String, detail: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for MeshGuardError {
    fn from(err: config::ConfigError) -> Self {
        MeshGuardError::Config(err.to_string())
    }
}

/// Result type alias for Meshguard operations.
pub type Result<T> = std::result::Result<T, MeshGuardError>;
