// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! Database module for persistent storage

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::sensors::{Reading, SensorSpec};

/// Full device configuration keyed by sensor id
pub type ConfigSnapshot = BTreeMap<String, SensorSpec>;

/// Storage failures. None of them are fatal to the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{operation} exceeded {budget:?}")]
    Timeout {
        operation: &'static str,
        budget: Duration,
    },
    #[error("storage worker failed: {0}")]
    Worker(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Durable store for readings and configuration snapshots
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Persist one reading
    async fn save_reading(&self, reading: &Reading) -> Result<(), StorageError>;

    /// Replace the device's configuration snapshot, creating it if absent
    async fn save_config(&self, device_id: &str, configs: &ConfigSnapshot) -> Result<(), StorageError>;

    /// Up to `limit` readings for a sensor, most recent first
    async fn latest_readings(&self, sensor_id: &str, limit: usize) -> Result<Vec<Reading>, StorageError>;
}

/// SQLite-backed [`ReadingStore`]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Database {
    /// Open or create database
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        // Create parent directories
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.path)?;

        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#)?;

        let db = Self::with_connection(conn, config.read_timeout, config.write_timeout)?;
        info!("Database opened at {:?}", config.path);
        Ok(db)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let defaults = StorageConfig::default();
        Self::with_connection(
            Connection::open_in_memory()?,
            defaults.read_timeout,
            defaults.write_timeout,
        )
    }

    fn with_connection(
        conn: Connection,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self, StorageError> {
        create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            read_timeout,
            write_timeout,
        })
    }

    /// Stored configuration snapshot for a device, if any
    pub async fn load_config(&self, device_id: &str) -> Result<Option<ConfigSnapshot>, StorageError> {
        let device_id = device_id.to_string();
        self.run("load_config", self.read_timeout, move |conn| {
            let text: Option<String> = conn
                .query_row(
                    "SELECT configs FROM configurations WHERE device_id = ?1",
                    params![device_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(match text {
                Some(text) => Some(serde_json::from_str(&text)?),
                None => None,
            })
        })
        .await
    }

    /// Run a blocking statement off the async runtime within `budget`
    async fn run<T, F>(&self, operation: &'static str, budget: Duration, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let task = tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&*guard)
        });

        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(StorageError::Worker(join.to_string())),
            Err(_) => Err(StorageError::Timeout { operation, budget }),
        }
    }
}

/// Create database tables
fn create_tables(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(r#"
        -- Sensor readings table
        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sensor_id TEXT NOT NULL,
            sensor_type TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            error TEXT,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_readings_sensor_time ON readings(sensor_id, timestamp);

        -- One configuration snapshot per device
        CREATE TABLE IF NOT EXISTS configurations (
            device_id TEXT PRIMARY KEY,
            configs TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
    "#)?;

    Ok(())
}

/// Fixed-width UTC timestamps so text ordering matches time ordering
fn encode_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(text: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp {:?}: {}", text, e)))
}

#[async_trait]
impl ReadingStore for Database {
    async fn save_reading(&self, reading: &Reading) -> Result<(), StorageError> {
        let reading = reading.clone();
        self.run("save_reading", self.write_timeout, move |conn| {
            conn.execute(
                "INSERT INTO readings (sensor_id, sensor_type, value, unit, timestamp, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    reading.sensor_id,
                    reading.sensor_type,
                    reading.value,
                    reading.unit,
                    encode_timestamp(&reading.timestamp),
                    reading.error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn save_config(&self, device_id: &str, configs: &ConfigSnapshot) -> Result<(), StorageError> {
        let device_id = device_id.to_string();
        let text = serde_json::to_string(configs)?;
        self.run("save_config", self.write_timeout, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO configurations (device_id, configs, timestamp) VALUES (?1, ?2, ?3)",
                params![device_id, text, encode_timestamp(&Utc::now())],
            )?;
            debug!(device = %device_id, "Saved configuration snapshot");
            Ok(())
        })
        .await
    }

    async fn latest_readings(&self, sensor_id: &str, limit: usize) -> Result<Vec<Reading>, StorageError> {
        let sensor_id = sensor_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run("latest_readings", self.read_timeout, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT sensor_id, sensor_type, value, unit, timestamp, error FROM readings
                 WHERE sensor_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )?;

            let rows = stmt.query_map(params![sensor_id, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?;

            let mut results = Vec::new();
            for row in rows {
                let (sensor_id, sensor_type, value, unit, timestamp, error) = row?;
                results.push(Reading {
                    sensor_id,
                    sensor_type,
                    value,
                    unit,
                    timestamp: decode_timestamp(&timestamp)?,
                    error,
                });
            }

            Ok(results)
        })
        .await
    }
}
