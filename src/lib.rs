//! # ECOS device bus
//!
//! Telemetry and command bus for the field devices of the ECOS ventures.
//! Devices publish readings on `<root>/<project>/<device>/telemetry`,
//! operators push commands on `<root>/<project>/<device>/command`, and a
//! local registry tracks which devices exist and in which state.
//!
//! ```text
//! error.rs       - BusError / ValidationError taxonomy
//! telemetry/     - TelemetryRecord and its Validator
//! registry.rs    - DeviceRegistry (device id -> DeviceInfo)
//! access.rs      - AccessPolicy seam and the project role table
//! transport/     - TransportSession over MQTT or the in-process broker
//! command.rs     - CommandEnvelope and CommandDispatcher
//! simulator.rs   - stand-in devices publishing periodic readings
//! bus.rs         - DeviceBus facade tying the pieces together
//! config.rs      - bus.toml loading and environment overrides
//! ```

pub mod access;
pub mod bus;
pub mod command;
pub mod config;
pub mod error;
pub mod registry;
pub mod simulator;
pub mod telemetry;
pub mod transport;

pub use access::{AccessPolicy, AllowAll, ProjectPermissions, Role};
pub use bus::DeviceBus;
pub use command::{Command, CommandDispatcher, CommandEnvelope};
pub use config::BusConfig;
pub use error::{BusError, BusResult, ValidationError};
pub use registry::{DeviceInfo, DeviceRegistry, DeviceStatus};
pub use simulator::{DeviceSimulator, SensorProfile};
pub use telemetry::{QualityFlag, TelemetryRecord, Validator};
pub use transport::{
    BusEvent, ConnectionState, Credentials, Endpoint, MemoryBroker, MqttConnector, Telemetry,
    TransportSession,
};
