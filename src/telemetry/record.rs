use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_SCHEMA_VERSION: &str = "1.0.0";

/// Quality marker attached by the producing device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityFlag {
    #[default]
    Valid,
    Suspect,
    Error,
}

impl QualityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityFlag::Valid => "valid",
            QualityFlag::Suspect => "suspect",
            QualityFlag::Error => "error",
        }
    }
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QualityFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(QualityFlag::Valid),
            "suspect" => Ok(QualityFlag::Suspect),
            "error" => Ok(QualityFlag::Error),
            other => Err(format!(
                "expected one of valid, suspect, error but got '{}'",
                other
            )),
        }
    }
}

/// One sensor reading as it travels over the wire.
///
/// Records are immutable once built; the only field the receiving side fills
/// in is `ingestion_time`. Two records for the same `sensor_id` and
/// `timestamp` describe the same logical reading, which is what consumers key
/// on when the broker delivers a message more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub sensor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    pub measurement_type: String,
    pub measurement_value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub quality_flag: QualityFlag,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub source_system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestion_time: Option<DateTime<Utc>>,
}

fn default_schema_version() -> String {
    DEFAULT_SCHEMA_VERSION.to_string()
}

impl TelemetryRecord {
    /// Builds a reading taken now with default quality and schema version.
    pub fn new(
        sensor_id: impl Into<String>,
        measurement_type: impl Into<String>,
        measurement_value: f64,
        unit: impl Into<String>,
        source_system: impl Into<String>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            location_id: None,
            measurement_type: measurement_type.into(),
            measurement_value,
            unit: unit.into(),
            timestamp: Utc::now(),
            quality_flag: QualityFlag::default(),
            schema_version: default_schema_version(),
            source_system: source_system.into(),
            ingestion_time: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_location(mut self, location_id: impl Into<String>) -> Self {
        self.location_id = Some(location_id.into());
        self
    }

    pub fn with_quality(mut self, quality_flag: QualityFlag) -> Self {
        self.quality_flag = quality_flag;
        self
    }

    /// Key under which duplicate deliveries of the same reading collapse.
    pub fn dedup_key(&self) -> (&str, DateTime<Utc>) {
        (&self.sensor_id, self.timestamp)
    }
}

impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}={}{} ({}) @ {}",
            self.sensor_id,
            self.measurement_type,
            self.measurement_value,
            self.unit,
            self.quality_flag,
            self.timestamp.to_rfc3339()
        )
    }
}
