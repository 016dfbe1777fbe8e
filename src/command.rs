//! Command framing and dispatch
//!
//! Commands travel on `<root>/<project>/<device>/command` as
//! `{action, params, timestamp}`. There is no reply channel: a device that
//! acts on a command reports the effect through its regular telemetry.

use crate::access::{AccessPolicy, Role};
use crate::error::{BusError, BusResult, ValidationError};
use crate::registry::DeviceRegistry;
use crate::transport::{TopicAddress, TransportSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Time of send
    pub timestamp: DateTime<Utc>,
}

impl CommandEnvelope {
    pub fn new(action: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            action: action.into(),
            params,
            timestamp: Utc::now(),
        }
    }

    /// Parses and checks an inbound command. `params` may be omitted but
    /// must be an object when present.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::new("payload", format!("invalid JSON: {}", e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ValidationError::new("payload", "expected a JSON object"))?;

        let action = match obj.get("action") {
            None | Some(Value::Null) => return Err(ValidationError::missing("action")),
            Some(Value::String(action)) if !action.trim().is_empty() => action.clone(),
            Some(Value::String(_)) => {
                return Err(ValidationError::new("action", "must not be empty"))
            }
            Some(_) => return Err(ValidationError::new("action", "expected a string")),
        };

        let params = match obj.get("params") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(params)) => params.clone(),
            Some(_) => return Err(ValidationError::new("params", "expected an object")),
        };

        let timestamp = match obj.get("timestamp") {
            None | Some(Value::Null) => return Err(ValidationError::missing("timestamp")),
            Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    ValidationError::new("timestamp", format!("'{}' is not RFC 3339: {}", raw, e))
                })?,
            Some(_) => return Err(ValidationError::new("timestamp", "expected a string")),
        };

        Ok(Self {
            action,
            params,
            timestamp,
        })
    }
}

/// A validated command together with the device it was addressed to
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub address: TopicAddress,
    pub envelope: CommandEnvelope,
}

/// Frames and publishes commands over the shared session.
///
/// Unlike [`DeviceRegistry::set_status`], which ignores unknown devices,
/// dispatch refuses any device the registry does not list under the given
/// project.
#[derive(Clone)]
pub struct CommandDispatcher {
    session: TransportSession,
    registry: Arc<DeviceRegistry>,
    policy: Arc<dyn AccessPolicy>,
}

impl CommandDispatcher {
    pub fn new(
        session: TransportSession,
        registry: Arc<DeviceRegistry>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        Self {
            session,
            registry,
            policy,
        }
    }

    /// Publishes `action` to the device's command topic and returns the
    /// envelope that went out. Resolves once the broker acknowledged it.
    pub async fn send_command(
        &self,
        role: Role,
        project_code: &str,
        device_id: &str,
        action: &str,
        params: Map<String, Value>,
    ) -> BusResult<CommandEnvelope> {
        if !self.policy.has_project_access(role, project_code) {
            warn!(%role, project_code, "command rejected by access policy");
            return Err(BusError::AccessDenied {
                role,
                project_code: project_code.to_string(),
            });
        }

        let known = self
            .registry
            .get(device_id)
            .is_some_and(|device| device.project_code == project_code);
        if !known {
            return Err(BusError::UnknownDevice {
                project_code: project_code.to_string(),
                device_id: device_id.to_string(),
            });
        }

        if action.trim().is_empty() {
            return Err(ValidationError::new("action", "must not be empty").into());
        }

        let address = TopicAddress::command(project_code, device_id)?;
        let envelope = CommandEnvelope::new(action, params);
        self.session.publish_command(&address, &envelope).await?;
        info!(project_code, device_id, action, "command dispatched");
        Ok(envelope)
    }
}
