//! # Telemetry Records
//!
//! Wire shape and schema contract for a single sensor reading. Field devices
//! are untrusted: whatever arrives on a telemetry topic goes through the
//! [`Validator`] before any handler sees it, and the same validator guards the
//! publish path so malformed readings never reach the broker.
//!
//! ```text
//! bytes ──► serde_json::Value ──► Validator ──► TelemetryRecord
//!                                     │
//!                                     └──► ValidationError { field, reason }
//! ```

pub mod record;
pub mod validator;

pub use record::{QualityFlag, TelemetryRecord, DEFAULT_SCHEMA_VERSION};
pub use validator::{SensorIdFormat, Validator, REQUIRED_FIELDS};
