//! Stand-in field devices
//!
//! A [`DeviceSimulator`] publishes one reading per tick for a single device
//! through the regular session, so simulated traffic passes the same
//! validation and topic mapping as real hardware. Readings follow a sine
//! around a baseline and are fully determined by the tick number.

use crate::registry::{DeviceInfo, DeviceStatus};
use crate::telemetry::{SensorIdFormat, TelemetryRecord};
use crate::transport::TransportSession;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SOURCE_SYSTEM: &str = "ecos-simulator";
/// Ticks per full sine period
const PERIOD_TICKS: f64 = 24.0;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SensorProfile {
    pub device_id: String,
    pub project_code: String,
    pub device_type: String,
    pub measurement_type: String,
    pub unit: String,
    pub baseline: f64,
    pub amplitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
}

impl SensorProfile {
    pub fn device_info(&self) -> DeviceInfo {
        let device = DeviceInfo::new(
            self.device_id.clone(),
            self.project_code.clone(),
            self.device_type.clone(),
            DeviceStatus::Active,
        );
        match &self.location_id {
            Some(location) => device.with_location(location.clone()),
            None => device,
        }
    }

    pub fn reading(&self, tick: u64) -> f64 {
        let phase = (tick as f64) * 2.0 * PI / PERIOD_TICKS;
        self.baseline + self.amplitude * phase.sin()
    }

    /// Three devices from different ventures.
    pub fn demo_fleet() -> Vec<Self> {
        vec![
            Self {
                device_id: "hydro-1".to_string(),
                project_code: "P13_HYDRO".to_string(),
                device_type: "micro-turbine".to_string(),
                measurement_type: "flow".to_string(),
                unit: "L/s".to_string(),
                baseline: 47.8,
                amplitude: 4.0,
                location_id: Some("intake-north".to_string()),
            },
            Self {
                device_id: "bulb-42".to_string(),
                project_code: "P08_BULB".to_string(),
                device_type: "led-driver".to_string(),
                measurement_type: "power".to_string(),
                unit: "W".to_string(),
                baseline: 9.5,
                amplitude: 0.5,
                location_id: None,
            },
            Self {
                device_id: "awg-7".to_string(),
                project_code: "P09_AWG".to_string(),
                device_type: "atmospheric-water-generator".to_string(),
                measurement_type: "water_output".to_string(),
                unit: "L/h".to_string(),
                baseline: 12.0,
                amplitude: 3.0,
                location_id: None,
            },
        ]
    }
}

pub struct DeviceSimulator {
    session: TransportSession,
    profile: SensorProfile,
    interval: Duration,
    sensor_id: String,
}

impl DeviceSimulator {
    pub fn new(session: TransportSession, profile: SensorProfile, interval: Duration) -> Self {
        let sensor_id = match session.validator().sensor_id_format() {
            SensorIdFormat::Token => format!("{}.{}", profile.device_id, profile.measurement_type),
            SensorIdFormat::Uuid => Uuid::new_v4().to_string(),
        };
        Self {
            session,
            profile,
            interval,
            sensor_id,
        }
    }

    pub fn profile(&self) -> &SensorProfile {
        &self.profile
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn record(&self, tick: u64) -> TelemetryRecord {
        let record = TelemetryRecord::new(
            self.sensor_id.clone(),
            self.profile.measurement_type.clone(),
            self.profile.reading(tick),
            self.profile.unit.clone(),
            SOURCE_SYSTEM,
        );
        match &self.profile.location_id {
            Some(location) => record.with_location(location.clone()),
            None => record,
        }
    }

    /// Publishes until `cancel` fires and returns how many readings the
    /// broker acknowledged. Failed publishes are logged and skipped.
    pub async fn run(self, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        let mut tick = 0u64;
        let mut published = 0u64;
        info!(
            device_id = %self.profile.device_id,
            project_code = %self.profile.project_code,
            "simulator started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let record = self.record(tick);
                    tick += 1;
                    match self
                        .session
                        .publish_telemetry(&self.profile.project_code, &self.profile.device_id, &record)
                        .await
                    {
                        Ok(()) => {
                            published += 1;
                            debug!(device_id = %self.profile.device_id, %record, "simulated reading");
                        }
                        Err(e) => warn!(device_id = %self.profile.device_id, error = %e, "simulated reading not published"),
                    }
                }
            }
        }

        info!(device_id = %self.profile.device_id, published, "simulator stopped");
        published
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(self.run(cancel))
    }
}
