//! Gateway configuration
//!
//! Lives at `~/.config/ecos-bus/bus.toml`. A default file is written on first
//! start; missing keys fall back to their defaults so older files keep
//! loading. Broker settings may be overridden through `MQTT_BROKER_HOST`,
//! `MQTT_BROKER_PORT`, `MQTT_USERNAME` and `MQTT_PASSWORD`.

use crate::access::ProjectPermissions;
use crate::error::ValidationError;
use crate::simulator::SensorProfile;
use crate::telemetry::{SensorIdFormat, Validator};
use crate::transport::{Credentials, Endpoint, MqttSettings, Namespace, DEFAULT_MQTT_PORT};
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CONFIG_DIR: &str = ".config/ecos-bus";
pub const CONFIG_FILE: &str = "bus.toml";
pub const MEMORY_SCHEME: &str = "memory://";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// `mqtt://host:port`, `tcp://host:port`, `host[:port]` or `memory://`
    pub url: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub request_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: format!("mqtt://localhost:{}", DEFAULT_MQTT_PORT),
            client_id: "ecos-gateway".to_string(),
            keep_alive_secs: 60,
            request_capacity: 100,
            username: None,
            password: None,
        }
    }
}

impl BrokerConfig {
    pub fn is_memory(&self) -> bool {
        self.url.trim().starts_with(MEMORY_SCHEME)
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        if self.is_memory() {
            return Ok(Endpoint::new("memory", 0));
        }
        Endpoint::parse(&self.url).map_err(|e| eyre!("Invalid broker url '{}': {}", self.url, e))
    }

    /// A username alone is sent with an empty password.
    pub fn credentials(&self) -> Option<Credentials> {
        self.username.as_ref().map(|username| {
            Credentials::new(username.clone(), self.password.clone().unwrap_or_default())
        })
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            client_id: self.client_id.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            request_capacity: self.request_capacity,
            ..MqttSettings::default()
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TopicsConfig {
    pub root: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            root: crate::transport::topic::DEFAULT_ROOT.to_string(),
        }
    }
}

impl TopicsConfig {
    pub fn namespace(&self) -> Result<Namespace, ValidationError> {
        Namespace::new(self.root.clone())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct ValidationConfig {
    pub sensor_id_format: SensorIdFormat,
}

impl ValidationConfig {
    pub fn validator(&self) -> Validator {
        Validator::new(self.sensor_id_format)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SimulatorConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub devices: Vec<SensorProfile>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
            devices: SensorProfile::demo_fleet(),
        }
    }
}

impl SimulatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct BusConfig {
    pub broker: BrokerConfig,
    pub topics: TopicsConfig,
    pub validation: ValidationConfig,
    pub simulator: SimulatorConfig,
    /// Role table per project; the ecosystem defaults apply when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<ProjectPermissions>,
}

impl BusConfig {
    pub fn config_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn permissions(&self) -> ProjectPermissions {
        self.permissions
            .clone()
            .unwrap_or_else(ProjectPermissions::ecosystem_defaults)
    }

    /// Writes the default configuration to `path` unless a file is already
    /// there.
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(());
        }
        info!(path = %path.display(), "Creating default configuration");
        BusConfig::default().save_to(path).await
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
    }

    /// Default path, default file on first run, environment overrides on top.
    pub async fn load() -> Result<Self> {
        let path = Self::config_path();
        Self::ensure_default_config(&path).await?;
        let mut config = Self::load_from(&path).await?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("MQTT_BROKER_HOST");
        let port = lookup("MQTT_BROKER_PORT").and_then(|raw| match raw.parse::<u16>() {
            Ok(port) => Some(port),
            Err(_) => {
                warn!(value = %raw, "Ignoring invalid MQTT_BROKER_PORT");
                None
            }
        });

        if host.is_some() || port.is_some() {
            let current = if self.broker.is_memory() {
                None
            } else {
                Endpoint::parse(&self.broker.url).ok()
            };
            let host = host
                .or_else(|| current.as_ref().map(|e| e.host.clone()))
                .unwrap_or_else(|| "localhost".to_string());
            let port = port
                .or_else(|| current.as_ref().map(|e| e.port))
                .unwrap_or(DEFAULT_MQTT_PORT);
            self.broker.url = format!("mqtt://{}:{}", host, port);
            info!(url = %self.broker.url, "Broker url taken from environment");
        }

        if let Some(username) = lookup("MQTT_USERNAME") {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.broker.password = Some(password);
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessPolicy, Role};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.broker.endpoint().unwrap(), Endpoint::new("localhost", 1883));
        assert_eq!(config.broker.client_id, "ecos-gateway");
        assert_eq!(config.topics.namespace().unwrap().root(), "ecos");
        assert_eq!(config.validation.sensor_id_format, SensorIdFormat::Token);
        assert!(config.broker.credentials().is_none());
        assert_eq!(config.simulator.devices.len(), 3);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: BusConfig = toml::from_str(
            r#"
            [broker]
            url = "memory://"

            [validation]
            sensor_id_format = "uuid"
            "#,
        )
        .unwrap();
        assert!(config.broker.is_memory());
        assert_eq!(config.broker.request_capacity, 100);
        assert_eq!(config.validation.validator().sensor_id_format(), SensorIdFormat::Uuid);
        assert_eq!(config.simulator, SimulatorConfig::default());
        assert!(config.permissions().has_project_access(Role::Operator, "P13_HYDRO"));
    }

    #[test]
    fn test_permissions_table_replaces_defaults() {
        let config: BusConfig = toml::from_str(
            r#"
            [permissions.projects]
            P13_HYDRO = ["ADMIN"]
            "#,
        )
        .unwrap();
        let permissions = config.permissions();
        assert!(permissions.has_project_access(Role::Admin, "P13_HYDRO"));
        assert!(!permissions.has_project_access(Role::Operator, "P13_HYDRO"));
        assert!(!permissions.has_project_access(Role::Admin, "P08_BULB"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BusConfig::default();
        config.apply_env_overrides(env(&[
            ("MQTT_BROKER_HOST", "broker.ecos.local"),
            ("MQTT_USERNAME", "gateway"),
            ("MQTT_PASSWORD", "s3cret"),
        ]));
        assert_eq!(config.broker.url, "mqtt://broker.ecos.local:1883");
        assert_eq!(
            config.broker.credentials(),
            Some(Credentials::new("gateway", "s3cret"))
        );

        config.apply_env_overrides(env(&[("MQTT_BROKER_PORT", "8883")]));
        assert_eq!(config.broker.url, "mqtt://broker.ecos.local:8883");

        config.apply_env_overrides(env(&[("MQTT_BROKER_PORT", "nope")]));
        assert_eq!(config.broker.url, "mqtt://broker.ecos.local:8883");
    }

    #[test]
    fn test_invalid_root_rejected() {
        let topics = TopicsConfig {
            root: "ecos/#".to_string(),
        };
        assert!(topics.namespace().is_err());
    }

    #[tokio::test]
    async fn test_default_file_written_once() {
        let dir = std::env::temp_dir().join(format!("ecos-bus-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join(CONFIG_FILE);

        BusConfig::ensure_default_config(&path).await.unwrap();
        assert_eq!(BusConfig::load_from(&path).await.unwrap(), BusConfig::default());

        let mut changed = BusConfig::default();
        changed.broker.url = "memory://".to_string();
        changed.save_to(&path).await.unwrap();
        BusConfig::ensure_default_config(&path).await.unwrap();
        assert!(BusConfig::load_from(&path).await.unwrap().broker.is_memory());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
