// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! Configuration module

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::sensors::SensorSpec;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device identity, used in every bus subject
    pub device_id: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Bus configuration
    #[serde(default)]
    pub bus: BusConfig,

    /// Persistence configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Sensors, in declaration order
    #[serde(default)]
    pub sensors: Vec<SensorSpec>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        let mut temperature = SensorSpec::new("temp-01", "temperature");
        temperature.frequency = Duration::from_secs(5);
        temperature.min = 18.0;
        temperature.max = 25.0;
        temperature.unit = "°C".to_string();

        let mut humidity = SensorSpec::new("hum-01", "humidity");
        humidity.frequency = Duration::from_secs(10);
        humidity.min = 30.0;
        humidity.max = 60.0;
        humidity.unit = "%".to_string();

        Self {
            device_id: "device-001".to_string(),
            log_level: default_log_level(),
            bus: BusConfig::default(),
            storage: StorageConfig::default(),
            sensors: vec![temperature, humidity],
        }
    }
}

/// Rejected static configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("device_id must not be empty")]
    EmptyDeviceId,
    #[error("sensor #{0} has an empty id")]
    EmptySensorId(usize),
    #[error("sensor {0} has an empty type")]
    EmptySensorType(String),
    #[error("sensor {0} has a zero frequency")]
    ZeroFrequency(String),
    #[error("sensor {0} has a non-finite min or max")]
    NonFiniteRange(String),
    #[error("sensor {id}: min {min} is greater than max {max}")]
    InvertedRange { id: String, min: f64, max: f64 },
    #[error("sensor id {0} is declared more than once")]
    DuplicateSensor(String),
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Reject configurations the runtime cannot honour.
    /// Duplicate ids are refused here the same way registration refuses them.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceId);
        }

        let mut seen = HashSet::new();
        for (index, sensor) in self.sensors.iter().enumerate() {
            if sensor.id.trim().is_empty() {
                return Err(ConfigError::EmptySensorId(index));
            }
            if sensor.sensor_type.trim().is_empty() {
                return Err(ConfigError::EmptySensorType(sensor.id.clone()));
            }
            if sensor.frequency.is_zero() {
                return Err(ConfigError::ZeroFrequency(sensor.id.clone()));
            }
            if !sensor.min.is_finite() || !sensor.max.is_finite() {
                return Err(ConfigError::NonFiniteRange(sensor.id.clone()));
            }
            if sensor.min > sensor.max {
                return Err(ConfigError::InvertedRange {
                    id: sensor.id.clone(),
                    min: sensor.min,
                    max: sensor.max,
                });
            }
            if !seen.insert(sensor.id.as_str()) {
                return Err(ConfigError::DuplicateSensor(sensor.id.clone()));
            }
        }

        Ok(())
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("iotsim"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

/// Which subject a reading is published on
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadingsTopic {
    /// `iot.<device>.readings.<type>`
    PerType,
    /// `iot.<device>.readings.<type>.<sensor>`
    #[default]
    PerSensor,
}

/// Bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// MQTT broker host. Empty means the in-process bus.
    pub mqtt_broker: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_client_id: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub keep_alive_secs: u64,

    /// Subject layout for published readings
    pub readings_topic: ReadingsTopic,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mqtt_broker: Some("localhost".to_string()),
            mqtt_port: 1883,
            mqtt_client_id: None,
            mqtt_username: None,
            mqtt_password: None,
            keep_alive_secs: 30,
            readings_topic: ReadingsTopic::PerSensor,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Enable database storage
    pub enabled: bool,

    /// Database path
    pub path: PathBuf,

    /// Budget for each read
    #[serde(with = "duration")]
    pub read_timeout: Duration,

    /// Budget for each write
    #[serde(with = "duration")]
    pub write_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data/iotsim.db"),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Serde adapter for human-readable durations ("5s", "1m30s", "250ms")
pub mod duration {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(text.trim()).map_err(de::Error::custom)
    }
}
