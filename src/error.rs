//! Error definitions for the telemetry and command bus

use crate::access::Role;
use crate::transport::ConnectionState;
use thiserror::Error;

/// A single schema violation in a telemetry or command payload.
///
/// `field` carries the wire name of the offending field (`sensorId`,
/// `measurementValue`, ...) or `payload` when the input is not a JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(field: &str) -> Self {
        Self::new(field, "required field is missing")
    }
}

/// Error types for bus operations
///
/// Every failure is scoped to the operation that produced it; nothing here is
/// fatal to the host process.
#[derive(Debug, Error)]
pub enum BusError {
    /// Malformed telemetry or command payload
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Broker unreachable, credentials rejected or the link died mid-operation
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation attempted before the session reached `connected`
    #[error("Session is not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// Command addressed to a device the registry does not know for that project
    #[error("Unknown device {device_id} in project {project_code}")]
    UnknownDevice {
        project_code: String,
        device_id: String,
    },

    /// The authorization collaborator refused the caller
    #[error("Access denied: role {role} may not address project {project_code}")]
    AccessDenied { role: Role, project_code: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Retrying the same call may succeed (at-least-once contract).
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Connection(_))
    }
}

pub type BusResult<T> = Result<T, BusError>;
