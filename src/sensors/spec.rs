// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! Sensor definitions and reading types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Sampling period given to sensors registered without one
pub const DEFAULT_FREQUENCY: Duration = Duration::from_secs(30);

/// Lower bound given to sensors registered without one
pub const DEFAULT_MIN: f64 = 0.0;

/// Upper bound given to sensors registered without one
pub const DEFAULT_MAX: f64 = 100.0;

/// Message carried by simulated failure readings
pub const SENSOR_ERROR_MESSAGE: &str = "sensor communication error";

/// Identity and behaviour of one virtual sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    /// Unique within a device, never changes
    pub id: String,

    /// Free-form type tag, e.g. "temperature"
    #[serde(rename = "type")]
    pub sensor_type: String,

    /// Sampling period
    #[serde(with = "crate::config::duration")]
    pub frequency: Duration,

    /// Lower bound of generated values
    #[serde(default)]
    pub min: f64,

    /// Upper bound of generated values
    #[serde(default)]
    pub max: f64,

    /// Unit label, may be empty
    #[serde(default)]
    pub unit: String,

    /// Disabled sensors never run
    #[serde(default)]
    pub enabled: bool,
}

impl SensorSpec {
    /// Spec with registration defaults: enabled, 30s, range 0..100, no unit
    pub fn new(id: &str, sensor_type: &str) -> Self {
        Self {
            id: id.to_string(),
            sensor_type: sensor_type.to_string(),
            frequency: DEFAULT_FREQUENCY,
            min: DEFAULT_MIN,
            max: DEFAULT_MAX,
            unit: String::new(),
            enabled: true,
        }
    }

    /// Bounds are finite and ordered
    pub fn has_valid_range(&self) -> bool {
        valid_range(self.min, self.max)
    }
}

/// `min <= max` with both ends finite
pub fn valid_range(min: f64, max: f64) -> bool {
    min.is_finite() && max.is_finite() && min <= max
}

/// One sample produced by a sensor, either a value or a simulated failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    #[serde(rename = "type")]
    pub sensor_type: String,
    /// Zero and meaningless when `error` is set
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reading {
    pub fn sample(spec: &SensorSpec, value: f64) -> Self {
        Self {
            sensor_id: spec.id.clone(),
            sensor_type: spec.sensor_type.clone(),
            value,
            unit: spec.unit.clone(),
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failure(spec: &SensorSpec, message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::sample(spec, 0.0)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Partial min/max change. Absent and wrongly-typed keys both end up `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThresholdUpdate {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ThresholdUpdate {
    /// Probe a loosely-typed JSON object for numeric `min` / `max`.
    /// Anything that is not an object yields an empty update.
    pub fn from_json(value: &Value) -> Self {
        Self {
            min: value.get("min").and_then(Value::as_f64),
            max: value.get("max").and_then(Value::as_f64),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Combine with a later update; keys present in `later` win
    pub fn merge(self, later: ThresholdUpdate) -> Self {
        Self {
            min: later.min.or(self.min),
            max: later.max.or(self.max),
        }
    }

    /// Resulting bounds when applied over `(min, max)`
    pub fn apply_to(&self, min: f64, max: f64) -> (f64, f64) {
        (self.min.unwrap_or(min), self.max.unwrap_or(max))
    }
}

/// Parse a human-readable sampling period. Zero and unparseable input give `None`.
pub fn parse_frequency(text: &str) -> Option<Duration> {
    humantime::parse_duration(text.trim())
        .ok()
        .filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registration_defaults() {
        let spec = SensorSpec::new("hum-02", "humidity");
        assert!(spec.enabled);
        assert_eq!(spec.frequency, Duration::from_secs(30));
        assert_eq!(spec.min, 0.0);
        assert_eq!(spec.max, 100.0);
        assert_eq!(spec.unit, "");
    }

    #[test]
    fn test_reading_json_shape() {
        let spec = SensorSpec::new("temp-01", "temperature");
        let ok = serde_json::to_value(Reading::sample(&spec, 21.5)).unwrap();
        assert_eq!(ok["sensor_id"], "temp-01");
        assert_eq!(ok["type"], "temperature");
        assert_eq!(ok["value"], 21.5);
        assert!(ok.get("error").is_none());

        let failed = serde_json::to_value(Reading::failure(&spec, SENSOR_ERROR_MESSAGE)).unwrap();
        assert_eq!(failed["error"], SENSOR_ERROR_MESSAGE);
        assert_eq!(failed["value"], 0.0);
    }

    #[test]
    fn test_threshold_probe_ignores_wrong_types() {
        let update = ThresholdUpdate::from_json(&json!({"min": "not-a-number", "max": 40}));
        assert_eq!(update.min, None);
        assert_eq!(update.max, Some(40.0));

        assert!(ThresholdUpdate::from_json(&json!("min")).is_empty());
        assert!(ThresholdUpdate::from_json(&json!({})).is_empty());
    }

    #[test]
    fn test_merge_prefers_later_keys() {
        let top = ThresholdUpdate { min: Some(50.0), max: Some(55.0) };
        let nested = ThresholdUpdate { min: None, max: Some(60.0) };
        assert_eq!(top.merge(nested), ThresholdUpdate { min: Some(50.0), max: Some(60.0) });
        assert!(ThresholdUpdate::default().merge(ThresholdUpdate::default()).is_empty());
    }

    #[test]
    fn test_valid_range() {
        assert!(valid_range(7.5, 7.5));
        assert!(valid_range(-1e308, 1e308));
        assert!(!valid_range(400.0, 100.0));
        assert!(!valid_range(f64::NAN, 1.0));
        assert!(!valid_range(0.0, f64::INFINITY));
    }

    #[test]
    fn test_parse_frequency() {
        assert_eq!(parse_frequency("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_frequency("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_frequency("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_frequency("0s"), None);
        assert_eq!(parse_frequency("soon"), None);
    }

    #[test]
    fn test_spec_serializes_frequency_as_text() {
        let spec = SensorSpec::new("p-1", "pressure");
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["frequency"], "30s");
        assert_eq!(value["type"], "pressure");

        let back: SensorSpec = serde_json::from_value(value).unwrap();
        assert_eq!(back, spec);
    }
}
