//! Broker-facing traits.
//!
//! A [`Connector`] produces one [`BrokerLink`] per successful handshake. The
//! link is the only thing that touches the wire. The
//! [`TransportSession`](crate::transport::TransportSession) owns it
//! exclusively and never lends it out.

use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Broker address, parsed from `mqtt://host:port`, `tcp://host:port` or a
/// bare `host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(url: &str) -> BusResult<Self> {
        let url = url.trim();
        let url = url.trim_start_matches("mqtt://");
        let url = url.trim_start_matches("tcp://");

        let parts: Vec<&str> = url.split(':').collect();
        match parts.as_slice() {
            [host] if !host.is_empty() => Ok(Self::new(*host, DEFAULT_MQTT_PORT)),
            [host, port] if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| {
                    BusError::Connection(format!("Invalid port in broker URL: {}", port))
                })?;
                Ok(Self::new(*host, port))
            }
            _ => Err(BusError::Connection(format!(
                "Invalid broker URL format: {}",
                url
            ))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Raw message as delivered by the broker, before any validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Performs one handshake. Resolves once the broker acknowledged the
    /// session or fails with [`BusError::Connection`]; never retries.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> BusResult<Arc<dyn BrokerLink>>;
}

#[async_trait]
pub trait BrokerLink: Send + Sync + 'static {
    /// Publishes with at-least-once quality. Resolves only after the broker
    /// acknowledged receipt.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Registers `filter` (MQTT wildcards allowed) and resolves once the
    /// broker granted it. Messages arrive on the returned receiver in broker
    /// order; the receiver ends when the link goes away.
    async fn subscribe(&self, filter: &str) -> BusResult<mpsc::UnboundedReceiver<InboundMessage>>;

    /// Closes the link and drops every subscription. Idempotent.
    async fn disconnect(&self);

    /// Completes once the link is gone, whether closed locally or lost.
    async fn closed(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_with_scheme() {
        assert_eq!(
            Endpoint::parse("mqtt://localhost:1883").unwrap(),
            Endpoint::new("localhost", 1883)
        );
        assert_eq!(
            Endpoint::parse("tcp://broker.ecos.local:8883").unwrap(),
            Endpoint::new("broker.ecos.local", 8883)
        );
    }

    #[test]
    fn test_parse_endpoint_default_port() {
        assert_eq!(
            Endpoint::parse("broker.local").unwrap(),
            Endpoint::new("broker.local", DEFAULT_MQTT_PORT)
        );
    }

    #[test]
    fn test_parse_endpoint_errors() {
        assert!(Endpoint::parse("mqtt://host:port").is_err());
        assert!(Endpoint::parse("mqtt://").is_err());
        assert!(Endpoint::parse("a:1:2").is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let debug = format!("{:?}", Credentials::new("gateway", "hunter2"));
        assert!(debug.contains("gateway"));
        assert!(!debug.contains("hunter2"));
    }
}
