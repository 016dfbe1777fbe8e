//! Wiring of registry, session, access policy and dispatcher.

use crate::access::{AccessPolicy, Role};
use crate::command::{CommandDispatcher, CommandEnvelope};
use crate::error::{BusError, BusResult};
use crate::registry::{DeviceInfo, DeviceRegistry, DeviceStatus};
use crate::simulator::{DeviceSimulator, SensorProfile};
use crate::telemetry::TelemetryRecord;
use crate::transport::TransportSession;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Everything a gateway process needs around one transport session.
///
/// The registry is owned by the bus instance rather than being global; two
/// buses never share device state unless handed the same registry.
#[derive(Clone)]
pub struct DeviceBus {
    registry: Arc<DeviceRegistry>,
    session: TransportSession,
    policy: Arc<dyn AccessPolicy>,
    dispatcher: CommandDispatcher,
}

impl DeviceBus {
    pub fn new(session: TransportSession, policy: Arc<dyn AccessPolicy>) -> Self {
        Self::with_registry(session, Arc::new(DeviceRegistry::new()), policy)
    }

    pub fn with_registry(
        session: TransportSession,
        registry: Arc<DeviceRegistry>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        let dispatcher = CommandDispatcher::new(session.clone(), registry.clone(), policy.clone());
        Self {
            registry,
            session,
            policy,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Registers `device` if `role` may address its project. Returns the
    /// entry it replaced.
    pub fn register_device(&self, role: Role, device: DeviceInfo) -> BusResult<Option<DeviceInfo>> {
        if !self.policy.has_project_access(role, &device.project_code) {
            warn!(%role, project_code = %device.project_code, device_id = %device.device_id, "registration rejected by access policy");
            return Err(BusError::AccessDenied {
                role,
                project_code: device.project_code,
            });
        }
        Ok(self.registry.register(device))
    }

    /// Lenient on purpose: unknown devices are ignored, see
    /// [`DeviceRegistry::set_status`].
    pub fn set_status(&self, device_id: &str, status: DeviceStatus) -> bool {
        self.registry.set_status(device_id, status)
    }

    pub async fn publish_telemetry(
        &self,
        project_code: &str,
        device_id: &str,
        record: &TelemetryRecord,
    ) -> BusResult<()> {
        self.session
            .publish_telemetry(project_code, device_id, record)
            .await
    }

    pub async fn send_command(
        &self,
        role: Role,
        project_code: &str,
        device_id: &str,
        action: &str,
        params: Map<String, Value>,
    ) -> BusResult<CommandEnvelope> {
        self.dispatcher
            .send_command(role, project_code, device_id, action, params)
            .await
    }

    /// Registers the profile's device and returns a simulator for it.
    pub fn simulate(
        &self,
        role: Role,
        profile: SensorProfile,
        interval: Duration,
    ) -> BusResult<DeviceSimulator> {
        self.register_device(role, profile.device_info())?;
        Ok(DeviceSimulator::new(self.session.clone(), profile, interval))
    }
}
