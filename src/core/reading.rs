//! Sensor reading types.
//!
//! Sensor firmware revisions disagree about which fields they send, so every
//! sensor value is optional and unknown keys are ignored. Types are still
//! checked: a string where a voltage is expected is rejected.

use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The sensor values carried by one sample.
///
/// Keys are the snake_case names emitted by the firmware. Absent values
/// serialize as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorValues {
    /// MQ-8 (hydrogen) gas sensor voltage
    #[serde(default)]
    pub mq8_voltage: Option<f64>,
    /// Secondary MQ gas sensor voltage
    #[serde(default)]
    pub mq_other_voltage: Option<f64>,
    /// Red channel pulse width from the color sensor
    #[serde(default)]
    pub color_r: Option<i64>,
    /// Green channel pulse width from the color sensor
    #[serde(default)]
    pub color_g: Option<i64>,
    /// Blue channel pulse width from the color sensor
    #[serde(default)]
    pub color_b: Option<i64>,
    /// Label derived on the device from the shortest pulse
    #[serde(default)]
    pub dominant_color: Option<String>,
    /// Temperature in degrees Celsius
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Relative humidity in percent
    #[serde(default)]
    pub humidity: Option<f64>,
}

impl SensorValues {
    /// Check whether no sensor value is present.
    pub fn is_empty(&self) -> bool {
        self.mq8_voltage.is_none()
            && self.mq_other_voltage.is_none()
            && self.color_r.is_none()
            && self.color_g.is_none()
            && self.color_b.is_none()
            && self.dominant_color.is_none()
            && self.temperature.is_none()
            && self.humidity.is_none()
    }
}

/// An inbound reading as posted by a sensor node.
///
/// `timestamp` may be omitted, in which case ingestion assigns one.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "WirePayload")]
pub struct ReadingPayload {
    pub timestamp: Option<DateTime<Utc>>,
    pub values: SensorValues,
}

/// Flat wire form of [`ReadingPayload`].
#[derive(Deserialize)]
struct WirePayload {
    /// Sample time (RFC 3339 string or epoch milliseconds)
    #[serde(default, deserialize_with = "timestamp_serde::deserialize_option")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "mq8Voltage")]
    mq8_voltage: Option<f64>,
    #[serde(default, alias = "mqOtherVoltage")]
    mq_other_voltage: Option<f64>,
    #[serde(default, alias = "colorR")]
    color_r: Option<i64>,
    #[serde(default, alias = "colorG")]
    color_g: Option<i64>,
    #[serde(default, alias = "colorB")]
    color_b: Option<i64>,
    #[serde(default, alias = "dominantColor")]
    dominant_color: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    humidity: Option<f64>,
    /// Unrecognized keys. Also restricts decoding to JSON objects.
    #[serde(flatten)]
    _unknown: HashMap<String, IgnoredAny>,
}

impl From<WirePayload> for ReadingPayload {
    fn from(wire: WirePayload) -> Self {
        Self {
            timestamp: wire.timestamp,
            values: SensorValues {
                mq8_voltage: wire.mq8_voltage,
                mq_other_voltage: wire.mq_other_voltage,
                color_r: wire.color_r,
                color_g: wire.color_g,
                color_b: wire.color_b,
                dominant_color: wire.dominant_color,
                temperature: wire.temperature,
                humidity: wire.humidity,
            },
        }
    }
}

impl ReadingPayload {
    /// Decode a payload from raw JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(bytes).map_err(|e| ValidationError::new(e.to_string()))
    }

    /// Build a payload carrying only sensor values.
    pub fn from_values(values: SensorValues) -> Self {
        Self {
            timestamp: None,
            values,
        }
    }
}

/// A complete reading with its ordering timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub values: SensorValues,
}

impl Reading {
    /// Finalize a payload, using `now` when it carries no timestamp.
    pub fn from_payload(payload: ReadingPayload, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: payload.timestamp.unwrap_or(now),
            values: payload.values,
        }
    }
}

/// Opaque identifier assigned to a stored reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredId(Uuid);

impl StoredId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StoredId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StoredId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reading as returned by the store, tagged with its identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReading {
    pub id: StoredId,
    #[serde(flatten)]
    pub reading: Reading,
}

/// Inbound data could not be accepted as a reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid reading: {}", self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Serde support for timestamps given as RFC 3339 text or epoch milliseconds.
mod timestamp_serde {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Text(String),
        Millis(i64),
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<RawTimestamp>::deserialize(deserializer)? {
            None => Ok(None),
            Some(RawTimestamp::Text(text)) => DateTime::parse_from_rfc3339(&text)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| D::Error::custom(format!("invalid timestamp '{text}': {e}"))),
            Some(RawTimestamp::Millis(ms)) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {ms}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_partial_payload() {
        let payload = ReadingPayload::from_json(br#"{"temperature": 21.5}"#).unwrap();
        assert_eq!(payload.values.temperature, Some(21.5));
        assert!(payload.timestamp.is_none());
        assert!(payload.values.mq8_voltage.is_none());
        assert!(payload.values.color_r.is_none());
        assert!(payload.values.dominant_color.is_none());
    }

    #[test]
    fn test_firmware_payload() {
        let body = br#"{
            "mq8_voltage": 1.234, "mq_other_voltage": 0.512,
            "color_r": 1200, "color_g": 1350, "color_b": 980,
            "dominant_color": "Blue - No Astringent",
            "temperature": 24.0, "humidity": 55.0
        }"#;
        let payload = ReadingPayload::from_json(body).unwrap();
        assert_eq!(payload.values.mq8_voltage, Some(1.234));
        assert_eq!(payload.values.color_b, Some(980));
        assert_eq!(
            payload.values.dominant_color.as_deref(),
            Some("Blue - No Astringent")
        );
    }

    #[test]
    fn test_camel_case_aliases() {
        let body = br#"{"mq8Voltage": 1.2, "colorR": 10, "dominantColor": "Red"}"#;
        let payload = ReadingPayload::from_json(body).unwrap();
        assert_eq!(payload.values.mq8_voltage, Some(1.2));
        assert_eq!(payload.values.color_r, Some(10));
        assert_eq!(payload.values.dominant_color.as_deref(), Some("Red"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let body = br#"{"ph": 6.8, "temperature": 25.3, "firmware": {"rev": 2}}"#;
        let payload = ReadingPayload::from_json(body).unwrap();
        assert_eq!(payload.values.temperature, Some(25.3));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        assert!(ReadingPayload::from_json(br#"{"temperature": "warm"}"#).is_err());
        assert!(ReadingPayload::from_json(br#"{"color_r": 12.5}"#).is_err());
        assert!(ReadingPayload::from_json(br#"{"dominant_color": 3}"#).is_err());
        assert!(ReadingPayload::from_json(br#"{"timestamp": "yesterday"}"#).is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(ReadingPayload::from_json(b"").is_err());
        assert!(ReadingPayload::from_json(b"42").is_err());
        assert!(ReadingPayload::from_json(b"[1, 2]").is_err());
        assert!(ReadingPayload::from_json(b"not json").is_err());
    }

    #[test]
    fn test_null_fields_are_absent() {
        let payload =
            ReadingPayload::from_json(br#"{"humidity": null, "timestamp": null}"#).unwrap();
        assert!(payload.values.humidity.is_none());
        assert!(payload.timestamp.is_none());
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 22, 10, 0, 0).unwrap();

        let text = ReadingPayload::from_json(br#"{"timestamp": "2024-01-22T10:00:00Z"}"#).unwrap();
        assert_eq!(text.timestamp, Some(expected));

        let offset =
            ReadingPayload::from_json(br#"{"timestamp": "2024-01-22T11:00:00+01:00"}"#).unwrap();
        assert_eq!(offset.timestamp, Some(expected));

        let millis = ReadingPayload::from_json(
            format!(r#"{{"timestamp": {}}}"#, expected.timestamp_millis()).as_bytes(),
        )
        .unwrap();
        assert_eq!(millis.timestamp, Some(expected));
    }

    #[test]
    fn test_reading_defaults_timestamp() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let reading = Reading::from_payload(ReadingPayload::default(), now);
        assert_eq!(reading.timestamp, now);
        assert!(reading.values.is_empty());
    }

    #[test]
    fn test_stored_reading_serializes_nulls() {
        let stored = StoredReading {
            id: StoredId::new(),
            reading: Reading {
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                values: SensorValues {
                    temperature: Some(24.0),
                    ..Default::default()
                },
            },
        };
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["temperature"], 24.0);
        assert!(json["color_r"].is_null());
        assert!(json["mq8_voltage"].is_null());
        assert_eq!(json["timestamp"], "2024-05-01T12:00:00Z");
        assert!(json["id"].is_string());
    }
}
