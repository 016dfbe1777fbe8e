//! # Transport
//!
//! One logical broker connection shared by every device of every project.
//!
//! ```text
//! transport/
//! ├── topic.rs    - namespace, addresses, wildcard filters
//! ├── link.rs     - Connector / BrokerLink seam and endpoint parsing
//! ├── mqtt.rs     - rumqttc-backed link with acknowledgment tracking
//! ├── memory.rs   - in-process broker for tests and local runs
//! └── session.rs  - TransportSession state machine and subscriptions
//! ```
//!
//! The session is the only component that holds a broker link. Telemetry
//! and commands share that link but never a topic: every address ends in
//! either `/telemetry` or `/command`.
//!
//! Delivery is at-least-once in both directions. A successful publish means
//! the broker acknowledged the message; a failed one may still have arrived,
//! so consumers deduplicate on `sensorId` + `timestamp`.

pub mod link;
pub mod memory;
pub mod mqtt;
pub mod session;
pub mod topic;

pub use link::{BrokerLink, Connector, Credentials, Endpoint, InboundMessage, DEFAULT_MQTT_PORT};
pub use memory::MemoryBroker;
pub use mqtt::{MqttConnector, MqttSettings};
pub use session::{
    BusEvent, CommandSubscription, ConnectionState, SessionStatus, Subscription, Telemetry,
    TelemetrySubscription, TransportSession,
};
pub use topic::{Channel, Namespace, TopicAddress, TopicFilter};
