//! Error types for hvnat

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    ConfigParse(String),

    #[error("Invalid config: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Host operation '{operation}' failed: {message}")]
    HostOperation { operation: String, message: String },

    #[error("Provisioning failed after reaching {state}")]
    Provisioning {
        state: String,
        #[source]
        source: Box<Error>,
        /// Manual cleanup steps, empty when rollback was clean
        remediation: Vec<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Insufficient privileges - run as Administrator")]
    InsufficientPrivileges,

    #[error("Hyper-V not available - enable the Hyper-V feature and its PowerShell module")]
    HyperVNotAvailable,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn host(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::HostOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error was raised before any host mutation
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound(_) | Error::ConfigParse(_) | Error::Validation { .. }
        )
    }

    /// Manual remediation steps attached to a failed provisioning run
    pub fn remediation(&self) -> &[String] {
        match self {
            Error::Provisioning { remediation, .. } => remediation,
            _ => &[],
        }
    }
}
