//! In-memory device registry
//!
//! Tracks which devices exist, which project owns them and their lifecycle
//! status. Status changes are explicit writes; nothing here derives liveness
//! from telemetry silence.
//!
//! The backing map sits behind an `RwLock` so handlers running on several
//! tokio workers can read concurrently while `register`/`set_status` are
//! mutually exclusive. Queries return owned snapshots, never live views.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Maintenance,
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Inactive => "inactive",
            DeviceStatus::Maintenance => "maintenance",
            DeviceStatus::Offline => "offline",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DeviceStatus::Active),
            "inactive" => Ok(DeviceStatus::Inactive),
            "maintenance" => Ok(DeviceStatus::Maintenance),
            "offline" => Ok(DeviceStatus::Offline),
            other => Err(format!("unknown device status '{}'", other)),
        }
    }
}

/// Registry entry for one physical or virtual device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub project_code: String,
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    pub status: DeviceStatus,
}

impl DeviceInfo {
    pub fn new(
        device_id: impl Into<String>,
        project_code: impl Into<String>,
        device_type: impl Into<String>,
        status: DeviceStatus,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            project_code: project_code.into(),
            device_type: device_type.into(),
            location_id: None,
            status,
        }
    }

    pub fn with_location(mut self, location_id: impl Into<String>) -> Self {
        self.location_id = Some(location_id.into());
        self
    }
}

/// Device identity to lifecycle state, keyed by `device_id` across all
/// projects.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<String, DeviceInfo>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer cannot leave an entry half-written (whole values are
    // swapped in), so a poisoned lock is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, DeviceInfo>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, DeviceInfo>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or fully replaces the entry for `device.device_id`.
    ///
    /// Returns the entry that was replaced, if any.
    pub fn register(&self, device: DeviceInfo) -> Option<DeviceInfo> {
        let device_id = device.device_id.clone();
        let previous = self.write().insert(device_id.clone(), device);
        match &previous {
            Some(old) => debug!(
                device_id = %device_id,
                previous_project = %old.project_code,
                "device re-registered, previous entry replaced"
            ),
            None => info!(device_id = %device_id, "device registered"),
        }
        previous
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceInfo> {
        self.read().get(device_id).cloned()
    }

    /// Updates the status of a known device.
    ///
    /// Unknown ids are ignored rather than rejected: status updates routinely
    /// race ahead of registration in event-driven flows. Returns whether an
    /// entry was updated.
    pub fn set_status(&self, device_id: &str, status: DeviceStatus) -> bool {
        match self.write().get_mut(device_id) {
            Some(device) => {
                debug!(device_id, from = %device.status, to = %status, "device status changed");
                device.status = status;
                true
            }
            None => {
                debug!(device_id, %status, "status update for unknown device ignored");
                false
            }
        }
    }

    pub fn list_by_project(&self, project_code: &str) -> Vec<DeviceInfo> {
        self.read()
            .values()
            .filter(|device| device.project_code == project_code)
            .cloned()
            .collect()
    }

    pub fn list_active(&self) -> Vec<DeviceInfo> {
        self.read()
            .values()
            .filter(|device| device.status == DeviceStatus::Active)
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<DeviceInfo> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bulb() -> DeviceInfo {
        DeviceInfo::new("bulb-42", "P08_BULB", "led-driver", DeviceStatus::Active)
    }

    #[test]
    fn test_list_by_project_returns_registered_device() {
        let registry = DeviceRegistry::new();
        registry.register(bulb());

        let devices = registry.list_by_project("P08_BULB");
        assert_eq!(devices, vec![bulb()]);
        assert!(registry.list_by_project("P13_HYDRO").is_empty());
    }

    #[test]
    fn test_register_twice_keeps_latest() {
        let registry = DeviceRegistry::new();
        registry.register(bulb());

        let replacement = DeviceInfo::new("bulb-42", "P08_BULB", "led-driver-v2", DeviceStatus::Maintenance)
            .with_location("barn-3");
        let previous = registry.register(replacement.clone());

        assert_eq!(previous, Some(bulb()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("bulb-42"), Some(replacement));
    }

    #[test]
    fn test_reregistration_replaces_without_merge() {
        let registry = DeviceRegistry::new();
        registry.register(bulb().with_location("barn-3"));
        registry.register(bulb());
        assert_eq!(registry.get("bulb-42").unwrap().location_id, None);
    }

    #[test]
    fn test_device_id_unique_across_projects() {
        let registry = DeviceRegistry::new();
        registry.register(bulb());
        registry.register(DeviceInfo::new("bulb-42", "P12_SOLAR", "inverter", DeviceStatus::Active));

        assert_eq!(registry.len(), 1);
        assert!(registry.list_by_project("P08_BULB").is_empty());
        assert_eq!(registry.list_by_project("P12_SOLAR").len(), 1);
    }

    #[test]
    fn test_get_missing_is_none() {
        let registry = DeviceRegistry::new();
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn test_set_status_unknown_device_is_noop() {
        let registry = DeviceRegistry::new();
        assert!(!registry.set_status("ghost", DeviceStatus::Offline));
        assert!(registry.get("ghost").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_status_and_list_active() {
        let registry = DeviceRegistry::new();
        registry.register(bulb());
        registry.register(DeviceInfo::new("hydro-1", "P13_HYDRO", "turbine", DeviceStatus::Inactive));

        assert_eq!(registry.list_active(), vec![bulb()]);

        assert!(registry.set_status("hydro-1", DeviceStatus::Active));
        assert!(registry.set_status("bulb-42", DeviceStatus::Offline));

        let active = registry.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].device_id, "hydro-1");
    }

    #[test]
    fn test_snapshot_is_not_live() {
        let registry = DeviceRegistry::new();
        registry.register(bulb());
        let snapshot = registry.list_active();
        registry.set_status("bulb-42", DeviceStatus::Offline);
        assert_eq!(snapshot[0].status, DeviceStatus::Active);
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_entries() {
        let registry = Arc::new(DeviceRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("dev-{}-{}", worker, i);
                        registry.register(DeviceInfo::new(id.clone(), "P09_AWG", "awg", DeviceStatus::Inactive));
                        registry.set_status(&id, DeviceStatus::Active);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 400);
        assert_eq!(registry.list_active().len(), 400);
    }

    #[test]
    fn test_device_info_wire_shape() {
        let json = serde_json::to_value(bulb()).unwrap();
        assert_eq!(json["deviceId"], "bulb-42");
        assert_eq!(json["projectCode"], "P08_BULB");
        assert_eq!(json["status"], "active");
        assert!(json.get("locationId").is_none());
    }
}
