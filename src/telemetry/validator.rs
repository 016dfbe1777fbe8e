//! Schema contract for inbound and outbound telemetry.
//!
//! Rules are applied in a fixed priority order and the first violation wins:
//!
//! 1. required fields present; descriptive string fields correctly typed
//! 2. `sensorId` is a string matching the configured identifier format
//! 3. `timestamp` and, when present, `ingestionTime` are RFC 3339 instants
//! 4. `qualityFlag`, when present, is `valid`, `suspect` or `error`
//! 5. `measurementValue` is finite
//!
//! Range plausibility (e.g. negative flow) is left to downstream consumers.

use super::record::{QualityFlag, TelemetryRecord, DEFAULT_SCHEMA_VERSION};
use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const REQUIRED_FIELDS: [&str; 6] = [
    "sensorId",
    "measurementType",
    "measurementValue",
    "unit",
    "timestamp",
    "sourceSystem",
];

const MAX_TOKEN_LEN: usize = 128;

/// Accepted shapes for `sensorId`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorIdFormat {
    /// 1-128 characters of `[A-Za-z0-9._:-]`; every UUID also qualifies
    #[default]
    Token,
    /// RFC 4122 UUID only
    Uuid,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Validator {
    sensor_id_format: SensorIdFormat,
}

impl Validator {
    pub fn new(sensor_id_format: SensorIdFormat) -> Self {
        Self { sensor_id_format }
    }

    pub fn sensor_id_format(&self) -> SensorIdFormat {
        self.sensor_id_format
    }

    /// Parses raw wire bytes and validates the resulting JSON value.
    pub fn validate_bytes(&self, payload: &[u8]) -> Result<TelemetryRecord, ValidationError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::new("payload", format!("invalid JSON: {}", e)))?;
        self.validate_value(&value)
    }

    /// Validates an untyped payload and returns the typed record with
    /// `qualityFlag`/`schemaVersion` defaults applied. Unknown fields are
    /// ignored so newer producers stay readable.
    pub fn validate_value(&self, payload: &Value) -> Result<TelemetryRecord, ValidationError> {
        let obj = payload
            .as_object()
            .ok_or_else(|| ValidationError::new("payload", "expected a JSON object"))?;
        self.validate_object(obj, None)
    }

    /// Serializes a typed record and runs the wire form through the same
    /// rules as [`validate_value`](Self::validate_value). Returns the bytes
    /// to publish.
    pub fn encode(&self, record: &TelemetryRecord) -> Result<Vec<u8>, ValidationError> {
        let value = serde_json::to_value(record)
            .map_err(|e| ValidationError::new("payload", format!("not serializable: {}", e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ValidationError::new("payload", "expected a JSON object"))?;
        // Non-finite numbers serialize as null; judge the typed value instead.
        self.validate_object(obj, Some(record.measurement_value))?;
        serde_json::to_vec(&value)
            .map_err(|e| ValidationError::new("payload", format!("not serializable: {}", e)))
    }

    /// Checks an already typed record before it is put on the wire.
    pub fn check(&self, record: &TelemetryRecord) -> Result<(), ValidationError> {
        self.encode(record).map(|_| ())
    }

    /// Each step only inspects the fields it owns.
    fn validate_object(
        &self,
        obj: &Map<String, Value>,
        typed_measurement: Option<f64>,
    ) -> Result<TelemetryRecord, ValidationError> {
        // 1. presence, and the types no later rule owns
        for name in REQUIRED_FIELDS {
            if name == "measurementValue" && typed_measurement.is_some() {
                continue;
            }
            if present(obj, name).is_none() {
                return Err(ValidationError::missing(name));
            }
        }
        let measurement_type = required_str(obj, "measurementType")?;
        let unit = required_str(obj, "unit")?;
        let source_system = required_str(obj, "sourceSystem")?;
        let location_id = optional_str(obj, "locationId")?;
        let schema_version = optional_str(obj, "schemaVersion")?;

        // 2. sensorId
        let sensor_id = required_str(obj, "sensorId")?;
        self.check_sensor_id(sensor_id)?;

        // 3. instants
        let timestamp = parse_instant("timestamp", required_str(obj, "timestamp")?)?;
        let ingestion_time = optional_str(obj, "ingestionTime")?
            .map(|raw| parse_instant("ingestionTime", raw))
            .transpose()?;

        // 4. qualityFlag
        let quality_flag = match optional_str(obj, "qualityFlag")? {
            Some(raw) => raw
                .parse::<QualityFlag>()
                .map_err(|reason| ValidationError::new("qualityFlag", reason))?,
            None => QualityFlag::default(),
        };

        // 5. measurementValue
        let measurement_value = match typed_measurement {
            Some(value) => value,
            None => measurement(obj)?,
        };
        check_finite(measurement_value)?;

        Ok(TelemetryRecord {
            sensor_id: sensor_id.to_string(),
            location_id: location_id.map(str::to_string),
            measurement_type: measurement_type.to_string(),
            measurement_value,
            unit: unit.to_string(),
            timestamp,
            quality_flag,
            schema_version: schema_version.unwrap_or(DEFAULT_SCHEMA_VERSION).to_string(),
            source_system: source_system.to_string(),
            ingestion_time,
        })
    }

    fn check_sensor_id(&self, sensor_id: &str) -> Result<(), ValidationError> {
        let ok = match self.sensor_id_format {
            SensorIdFormat::Uuid => Uuid::parse_str(sensor_id).is_ok(),
            SensorIdFormat::Token => is_token(sensor_id),
        };
        if ok {
            Ok(())
        } else {
            Err(ValidationError::new(
                "sensorId",
                format!(
                    "'{}' is not a valid {} identifier",
                    sensor_id,
                    match self.sensor_id_format {
                        SensorIdFormat::Uuid => "uuid",
                        SensorIdFormat::Token => "token",
                    }
                ),
            ))
        }
    }
}

fn is_token(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= MAX_TOKEN_LEN
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// Explicit `null` counts as absent.
fn present<'a>(obj: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    obj.get(name).filter(|v| !v.is_null())
}

fn required_str<'a>(obj: &'a Map<String, Value>, name: &str) -> Result<&'a str, ValidationError> {
    optional_str(obj, name)?.ok_or_else(|| ValidationError::missing(name))
}

fn optional_str<'a>(
    obj: &'a Map<String, Value>,
    name: &str,
) -> Result<Option<&'a str>, ValidationError> {
    match present(obj, name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(ValidationError::new(
            name,
            format!("expected a string but got {}", json_type(other)),
        )),
    }
}

fn measurement(obj: &Map<String, Value>) -> Result<f64, ValidationError> {
    match present(obj, "measurementValue") {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| ValidationError::new("measurementValue", "number out of range")),
        Some(other) => Err(ValidationError::new(
            "measurementValue",
            format!("expected a number but got {}", json_type(other)),
        )),
        None => Err(ValidationError::missing("measurementValue")),
    }
}

fn parse_instant(field: &str, raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ValidationError::new(field, format!("'{}' is not an ISO-8601 instant: {}", raw, e)))
}

fn check_finite(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::new(
            "measurementValue",
            format!("expected a finite number but got {}", value),
        ))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn hydro_payload() -> Value {
        json!({
            "sensorId": "s1",
            "measurementType": "flow",
            "measurementValue": 47.8,
            "unit": "L/s",
            "timestamp": "2024-01-01T00:00:00Z",
            "sourceSystem": "hydro-sim"
        })
    }

    #[test]
    fn test_valid_payload_gets_defaults() {
        let record = Validator::default().validate_value(&hydro_payload()).unwrap();
        assert_eq!(record.sensor_id, "s1");
        assert_eq!(record.measurement_value, 47.8);
        assert_eq!(record.quality_flag, QualityFlag::Valid);
        assert_eq!(record.schema_version, "1.0.0");
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert!(record.location_id.is_none());
        assert!(record.ingestion_time.is_none());
    }

    #[test]
    fn test_each_missing_required_field_is_named() {
        let validator = Validator::default();
        for name in REQUIRED_FIELDS {
            let mut payload = hydro_payload();
            payload.as_object_mut().unwrap().remove(name);
            let err = validator.validate_value(&payload).unwrap_err();
            assert_eq!(err.field, name);
        }
    }

    #[test]
    fn test_null_counts_as_missing() {
        let mut payload = hydro_payload();
        payload["unit"] = Value::Null;
        let err = Validator::default().validate_value(&payload).unwrap_err();
        assert_eq!(err, ValidationError::missing("unit"));
    }

    #[test]
    fn test_missing_field_wins_over_later_rules() {
        let mut payload = hydro_payload();
        payload["sensorId"] = json!("not a token!");
        payload["timestamp"] = json!("yesterday");
        payload.as_object_mut().unwrap().remove("sourceSystem");
        let err = Validator::default().validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "sourceSystem");
    }

    #[test]
    fn test_sensor_id_checked_before_timestamp() {
        let mut payload = hydro_payload();
        payload["sensorId"] = json!("has space");
        payload["timestamp"] = json!("yesterday");
        let err = Validator::default().validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "sensorId");
    }

    #[test]
    fn test_timestamp_checked_before_measurement_value() {
        let mut payload = hydro_payload();
        payload["measurementValue"] = json!("NaN");
        payload["timestamp"] = json!("yesterday");
        let err = Validator::default().validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "timestamp");
    }

    #[test]
    fn test_sensor_id_checked_before_quality_flag_type() {
        let mut payload = hydro_payload();
        payload["sensorId"] = json!("has space");
        payload["qualityFlag"] = json!(5);
        let err = Validator::default().validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "sensorId");
    }

    #[test]
    fn test_later_rules_in_order() {
        let validator = Validator::default();

        let mut payload = hydro_payload();
        payload["ingestionTime"] = json!(17);
        payload["qualityFlag"] = json!("great");
        assert_eq!(validator.validate_value(&payload).unwrap_err().field, "ingestionTime");

        let mut payload = hydro_payload();
        payload["qualityFlag"] = json!(["valid"]);
        payload["measurementValue"] = json!("NaN");
        let err = validator.validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "qualityFlag");
        assert!(err.reason.contains("array"));

        let mut payload = hydro_payload();
        payload["measurementValue"] = json!(true);
        let err = validator.validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "measurementValue");
        assert!(err.reason.contains("boolean"));
    }

    #[test]
    fn test_non_string_sensor_id_wins_over_timestamp() {
        let mut payload = hydro_payload();
        payload["sensorId"] = json!(42);
        payload["timestamp"] = json!("yesterday");
        let err = Validator::default().validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "sensorId");
    }

    #[test]
    fn test_string_nan_measurement_rejected() {
        let mut payload = hydro_payload();
        payload["measurementValue"] = json!("NaN");
        let err = Validator::default().validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "measurementValue");
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut payload = hydro_payload();
        payload["unit"] = json!(5);
        let err = Validator::default().validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "unit");
        assert!(err.reason.contains("number"));
    }

    #[test]
    fn test_malformed_timestamps_rejected() {
        let mut payload = hydro_payload();
        payload["timestamp"] = json!("2024-13-01T00:00:00Z");
        let err = Validator::default().validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "timestamp");

        let mut payload = hydro_payload();
        payload["ingestionTime"] = json!("soon");
        let err = Validator::default().validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "ingestionTime");
    }

    #[test]
    fn test_offset_timestamp_normalised_to_utc() {
        let mut payload = hydro_payload();
        payload["timestamp"] = json!("2024-01-01T02:00:00+02:00");
        let record = Validator::default().validate_value(&payload).unwrap();
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_quality_flag_enum() {
        let mut payload = hydro_payload();
        payload["qualityFlag"] = json!("suspect");
        let record = Validator::default().validate_value(&payload).unwrap();
        assert_eq!(record.quality_flag, QualityFlag::Suspect);

        payload["qualityFlag"] = json!("great");
        let err = Validator::default().validate_value(&payload).unwrap_err();
        assert_eq!(err.field, "qualityFlag");
    }

    #[test]
    fn test_non_object_payload() {
        let err = Validator::default().validate_value(&json!([1, 2])).unwrap_err();
        assert_eq!(err.field, "payload");

        let err = Validator::default().validate_bytes(b"{not json").unwrap_err();
        assert_eq!(err.field, "payload");
    }

    #[test]
    fn test_uuid_format() {
        let validator = Validator::new(SensorIdFormat::Uuid);
        let err = validator.validate_value(&hydro_payload()).unwrap_err();
        assert_eq!(err.field, "sensorId");

        let mut payload = hydro_payload();
        payload["sensorId"] = json!("6f1c2a8e-6c3b-4c55-9d2e-0a6b1f3e7d21");
        assert!(validator.validate_value(&payload).is_ok());
    }

    #[test]
    fn test_typed_check_rejects_non_finite() {
        let validator = Validator::default();
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let record = TelemetryRecord::new("s1", "flow", value, "L/s", "hydro-sim");
            let err = validator.check(&record).unwrap_err();
            assert_eq!(err.field, "measurementValue");
        }
    }

    #[test]
    fn test_encode_rejects_what_the_wire_would_reject() {
        let validator = Validator::default();
        let record = TelemetryRecord::new("s1", "flow", 1.0, "L/s", "hydro-sim")
            .with_timestamp(Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap());
        let bytes = serde_json::to_vec(&record).unwrap();
        assert_eq!(validator.validate_bytes(&bytes).unwrap_err().field, "timestamp");
        assert_eq!(validator.encode(&record).unwrap_err().field, "timestamp");

        let bad_id = TelemetryRecord::new("s 1", "flow", f64::NAN, "L/s", "hydro-sim");
        assert_eq!(validator.encode(&bad_id).unwrap_err().field, "sensorId");
    }

    #[test]
    fn test_encoded_bytes_validate() {
        let validator = Validator::default();
        let record = TelemetryRecord::new("s1", "flow", 47.8, "L/s", "hydro-sim");
        let bytes = validator.encode(&record).unwrap();
        assert_eq!(validator.validate_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn test_serialized_record_validates_back_equal() {
        let record = TelemetryRecord::new("bulb-42.v", "voltage", 12.5, "V", "bulb-fw")
            .with_location("loc-7")
            .with_quality(QualityFlag::Suspect);
        let bytes = serde_json::to_vec(&record).unwrap();
        let parsed = Validator::default().validate_bytes(&bytes).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let mut payload = hydro_payload();
        payload["firmware"] = json!("2.1.0");
        assert!(Validator::default().validate_value(&payload).is_ok());
    }
}
