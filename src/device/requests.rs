// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! Request kinds, decoding and error responses
//!
//! Bodies are loosely typed JSON. Required fields must be non-empty strings;
//! optional fields that are present with the wrong type are treated exactly
//! like absent ones.

use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::sensors::{parse_frequency, SensorSpec, ThresholdUpdate};

/// Request/response endpoints served by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Config,
    Status,
    ConfigUpdate,
    Register,
    LatestReading,
}

impl RequestKind {
    pub const ALL: [RequestKind; 5] = [
        RequestKind::Config,
        RequestKind::Status,
        RequestKind::ConfigUpdate,
        RequestKind::Register,
        RequestKind::LatestReading,
    ];

    /// Bus subject for this endpoint on `device_id`
    pub fn subject(self, device_id: &str) -> String {
        let suffix = match self {
            RequestKind::Config => "config",
            RequestKind::Status => "status",
            RequestKind::ConfigUpdate => "config.update",
            RequestKind::Register => "sensor.register",
            RequestKind::LatestReading => "readings.latest",
        };
        format!("iot.{}.{}", device_id, suffix)
    }

    pub fn describe(self) -> &'static str {
        match self {
            RequestKind::Config => "get sensor configs",
            RequestKind::Status => "get device status",
            RequestKind::ConfigUpdate => "update sensor configs",
            RequestKind::Register => "register a new sensor",
            RequestKind::LatestReading => "get latest stored reading",
        }
    }
}

/// Request failures. The display text is what the requester sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("invalid JSON")]
    InvalidJson,
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("sensor not found")]
    SensorNotFound,
    #[error("sensor already exists")]
    SensorExists,
    #[error("min must not exceed max")]
    InvalidRange,
    #[error("storage not available")]
    StorageUnavailable,
    #[error("failed to retrieve readings")]
    RetrievalFailed,
    #[error("no readings found")]
    NoReadings,
}

impl RequestError {
    /// `{"error": "<message>"}`
    pub fn to_response(&self) -> Value {
        json!({ "error": self.to_string() })
    }
}

fn decode_object(payload: &[u8]) -> Result<Map<String, Value>, RequestError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(RequestError::InvalidJson),
    }
}

fn required_str(body: &Map<String, Value>, field: &'static str) -> Result<String, RequestError> {
    body.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(RequestError::MissingField(field))
}

fn optional_frequency(body: &Map<String, Value>) -> Option<Duration> {
    body.get("frequency").and_then(Value::as_str).and_then(parse_frequency)
}

/// Body of `iot.<device>.config.update`
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateConfigRequest {
    pub sensor_id: String,
    pub frequency: Option<Duration>,
    /// Top-level `min` / `max`
    pub thresholds: ThresholdUpdate,
    /// Legacy nested `thresholds` object
    pub nested_thresholds: ThresholdUpdate,
}

impl UpdateConfigRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, RequestError> {
        let body = decode_object(payload)?;
        let sensor_id = required_str(&body, "sensor_id")?;

        Ok(Self {
            sensor_id,
            frequency: optional_frequency(&body),
            thresholds: ThresholdUpdate::from_json(&Value::Object(body.clone())),
            nested_thresholds: body
                .get("thresholds")
                .map(ThresholdUpdate::from_json)
                .unwrap_or_default(),
        })
    }
}

/// Body of `iot.<device>.sensor.register`
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterRequest {
    pub sensor_id: String,
    pub sensor_type: String,
    pub frequency: Option<Duration>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub unit: Option<String>,
}

impl RegisterRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, RequestError> {
        let body = decode_object(payload)?;
        let sensor_id = required_str(&body, "sensor_id")?;
        let sensor_type = required_str(&body, "type")?;

        Ok(Self {
            sensor_id,
            sensor_type,
            frequency: optional_frequency(&body),
            min: body.get("min").and_then(Value::as_f64),
            max: body.get("max").and_then(Value::as_f64),
            unit: body.get("unit").and_then(Value::as_str).map(str::to_string),
        })
    }

    /// Registration defaults overridden by whatever was supplied.
    /// The resulting range is not checked here.
    pub fn into_spec(self) -> SensorSpec {
        let mut spec = SensorSpec::new(&self.sensor_id, &self.sensor_type);
        if let Some(frequency) = self.frequency {
            spec.frequency = frequency;
        }
        if let Some(min) = self.min {
            spec.min = min;
        }
        if let Some(max) = self.max {
            spec.max = max;
        }
        if let Some(unit) = self.unit {
            spec.unit = unit;
        }
        spec
    }
}

/// Body of `iot.<device>.readings.latest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestReadingRequest {
    pub sensor_id: String,
}

impl LatestReadingRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, RequestError> {
        let body = decode_object(payload)?;
        Ok(Self {
            sensor_id: required_str(&body, "sensor_id")?,
        })
    }
}
