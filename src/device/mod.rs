// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! Device runtime - owns the sensors and answers requests about them
//!
//! Every request subject gets its own subscription loop, and every request
//! received is handled on its own task. Sensor state is only ever touched
//! through [`SensorRuntime`]'s locked operations, so a lookup followed by an
//! update is not atomic across the device as a whole.

mod requests;

pub use requests::{
    LatestReadingRequest, RegisterRequest, RequestError, RequestKind, UpdateConfigRequest,
};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, BusError, BusMessage, Subscription};
use crate::config::ReadingsTopic;
use crate::db::{ConfigSnapshot, ReadingStore};
use crate::sensors::{SensorRuntime, SensorSpec};

/// A simulated device and its sensors
pub struct DeviceRuntime {
    id: String,
    sensors: RwLock<Vec<Arc<SensorRuntime>>>,
    bus: Arc<dyn Bus>,
    store: Option<Arc<dyn ReadingStore>>,
    topic: ReadingsTopic,
    /// Captured by `start`; later registrations run on children of it
    shutdown: Mutex<Option<CancellationToken>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    handlers: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceRuntime {
    /// One sensor runtime per spec, in the given order
    pub fn new(
        id: &str,
        specs: Vec<SensorSpec>,
        bus: Arc<dyn Bus>,
        store: Option<Arc<dyn ReadingStore>>,
        topic: ReadingsTopic,
    ) -> Self {
        let sensors = specs
            .into_iter()
            .map(|spec| Arc::new(SensorRuntime::new(spec, bus.clone(), store.clone(), topic)))
            .collect();

        Self {
            id: id.to_string(),
            sensors: RwLock::new(sensors),
            bus,
            store,
            topic,
            shutdown: Mutex::new(None),
            tasks: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.read().len()
    }

    /// First sensor with this id
    pub fn sensor(&self, sensor_id: &str) -> Option<Arc<SensorRuntime>> {
        self.sensors
            .read()
            .iter()
            .find(|s| s.id() == sensor_id)
            .cloned()
    }

    /// Request subjects this device answers on
    pub fn subjects(&self) -> Vec<String> {
        RequestKind::ALL.iter().map(|kind| kind.subject(&self.id)).collect()
    }

    /// Every sensor's current spec keyed by id
    pub fn snapshot(&self) -> ConfigSnapshot {
        self.sensors
            .read()
            .iter()
            .map(|s| (s.id().to_string(), s.snapshot()))
            .collect()
    }

    /// Subscribe the request handlers, then launch every sensor loop.
    /// Returns once everything is spawned.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), BusError> {
        *self.shutdown.lock() = Some(cancel.clone());

        for kind in RequestKind::ALL {
            let subject = kind.subject(&self.id);
            let subscription = self.bus.subscribe(&subject).await?;
            info!("Serving {} on {}", kind.describe(), subject);

            let device = Arc::clone(self);
            let token = cancel.clone();
            let handle = tokio::spawn(async move { device.serve(kind, subscription, token).await });
            self.handlers.lock().push(handle);
        }

        let sensors: Vec<Arc<SensorRuntime>> = self.sensors.read().clone();
        for sensor in sensors {
            self.launch(sensor, cancel.clone());
        }

        info!(device = %self.id, sensors = self.sensor_count(), "Device started");
        Ok(())
    }

    /// Wait for every sensor loop and request loop to finish
    pub async fn join(&self) {
        let sensors: Vec<JoinHandle<()>> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        let handlers: Vec<JoinHandle<()>> = self.handlers.lock().drain(..).collect();

        for result in join_all(sensors.into_iter().chain(handlers)).await {
            if let Err(e) = result {
                error!("Device task failed: {}", e);
            }
        }
        info!(device = %self.id, "Device stopped");
    }

    fn launch(&self, sensor: Arc<SensorRuntime>, cancel: CancellationToken) {
        let device_id = self.id.clone();
        let sensor_id = sensor.id().to_string();
        let handle = tokio::spawn(async move { sensor.start(cancel, &device_id).await });

        if let Some(previous) = self.tasks.lock().insert(sensor_id, handle) {
            previous.abort();
        }
    }

    async fn serve(self: Arc<Self>, kind: RequestKind, mut subscription: Subscription, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = subscription.next() => message,
            };

            let Some(message) = message else {
                warn!(subject = %subscription.subject(), "Subscription closed");
                break;
            };

            let device = Arc::clone(&self);
            tokio::spawn(async move { device.answer(kind, message).await });
        }
        debug!(subject = %subscription.subject(), "Request loop stopped");
    }

    async fn answer(&self, kind: RequestKind, message: BusMessage) {
        let response = self.handle(kind, &message.payload).await;

        let Some(reply) = message.reply else {
            debug!(subject = %message.subject, "Request without reply subject, dropping response");
            return;
        };

        match serde_json::to_vec(&response) {
            Ok(payload) => {
                if let Err(e) = self.bus.respond(&reply, payload).await {
                    warn!("Error responding on {}: {}", reply, e);
                }
            }
            Err(e) => warn!("Error encoding response for {}: {}", message.subject, e),
        }
    }

    /// Handle one request body. Always yields a response, errors included.
    pub async fn handle(&self, kind: RequestKind, payload: &[u8]) -> Value {
        let result = match kind {
            RequestKind::Config => Ok(self.handle_config()),
            RequestKind::Status => Ok(self.handle_status()),
            RequestKind::ConfigUpdate => self.handle_update(payload).await,
            RequestKind::Register => self.handle_register(payload).await,
            RequestKind::LatestReading => self.handle_latest(payload).await,
        };

        result.unwrap_or_else(|e| {
            debug!(device = %self.id, ?kind, "Request failed: {}", e);
            e.to_response()
        })
    }

    fn handle_config(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|e| {
            warn!("Error encoding configuration: {}", e);
            json!({ "error": e.to_string() })
        })
    }

    fn handle_status(&self) -> Value {
        let sensors = self.sensors.read();
        let enabled = sensors.iter().filter(|s| s.is_enabled()).count();

        json!({
            "device_id": self.id,
            "total": sensors.len(),
            "enabled": enabled,
            "disabled": sensors.len() - enabled,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    async fn handle_update(&self, payload: &[u8]) -> Result<Value, RequestError> {
        let request = UpdateConfigRequest::decode(payload)?;
        let sensor = self.sensor(&request.sensor_id).ok_or(RequestError::SensorNotFound)?;

        if let Some(frequency) = request.frequency {
            sensor.update_frequency(frequency);
        }
        // Nested keys override top-level ones; the range check sees the final bounds
        sensor.update_thresholds(request.thresholds.merge(request.nested_thresholds));

        self.persist_config().await;
        Ok(json!({ "status": "updated" }))
    }

    async fn handle_register(&self, payload: &[u8]) -> Result<Value, RequestError> {
        let request = RegisterRequest::decode(payload)?;
        let spec = request.into_spec();
        if !spec.has_valid_range() {
            return Err(RequestError::InvalidRange);
        }

        let sensor = Arc::new(SensorRuntime::new(
            spec.clone(),
            self.bus.clone(),
            self.store.clone(),
            self.topic,
        ));

        {
            let mut sensors = self.sensors.write();
            if sensors.iter().any(|s| s.id() == spec.id) {
                return Err(RequestError::SensorExists);
            }
            sensors.push(sensor.clone());
        }

        info!(device = %self.id, "Registered sensor {} ({})", spec.id, spec.sensor_type);

        let token = self.shutdown.lock().as_ref().map(CancellationToken::child_token);
        if let Some(token) = token {
            self.launch(sensor, token);
        }

        self.persist_config().await;
        Ok(json!({
            "status": "registered",
            "sensor_id": spec.id,
            "config": spec,
        }))
    }

    async fn handle_latest(&self, payload: &[u8]) -> Result<Value, RequestError> {
        let request = LatestReadingRequest::decode(payload)?;
        if self.sensor(&request.sensor_id).is_none() {
            return Err(RequestError::SensorNotFound);
        }

        let store = self.store.as_ref().ok_or(RequestError::StorageUnavailable)?;
        let readings = store.latest_readings(&request.sensor_id, 1).await.map_err(|e| {
            warn!("Error retrieving readings for {}: {}", request.sensor_id, e);
            RequestError::RetrievalFailed
        })?;

        let latest = readings.into_iter().next().ok_or(RequestError::NoReadings)?;
        Ok(json!({
            "sensor_id": request.sensor_id,
            "latest_reading": latest,
        }))
    }

    /// Store the full configuration snapshot when persistence is configured
    async fn persist_config(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save_config(&self.id, &self.snapshot()).await {
            warn!("Error saving configuration for {}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::db::{Database, StorageError};
    use crate::sensors::Reading;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FailingStore;

    #[async_trait]
    impl ReadingStore for FailingStore {
        async fn save_reading(&self, _reading: &Reading) -> Result<(), StorageError> {
            Err(StorageError::Worker("offline".into()))
        }

        async fn save_config(&self, _device_id: &str, _configs: &ConfigSnapshot) -> Result<(), StorageError> {
            Err(StorageError::Worker("offline".into()))
        }

        async fn latest_readings(&self, _sensor_id: &str, _limit: usize) -> Result<Vec<Reading>, StorageError> {
            Err(StorageError::Timeout {
                operation: "latest_readings",
                budget: Duration::from_secs(5),
            })
        }
    }

    fn specs() -> Vec<SensorSpec> {
        vec![
            SensorSpec {
                min: 20.0,
                max: 30.0,
                unit: "°C".into(),
                ..SensorSpec::new("temp-01", "temperature")
            },
            SensorSpec {
                enabled: false,
                ..SensorSpec::new("hum-01", "humidity")
            },
        ]
    }

    fn device_with(store: Option<Arc<dyn ReadingStore>>) -> (Arc<DeviceRuntime>, Arc<LocalBus>) {
        let bus = Arc::new(LocalBus::default());
        let device = DeviceRuntime::new("dev1", specs(), bus.clone(), store, ReadingsTopic::PerSensor);
        (Arc::new(device), bus)
    }

    fn device() -> Arc<DeviceRuntime> {
        device_with(None).0
    }

    #[test]
    fn test_construction_preserves_order() {
        let device = device();
        let ids: Vec<String> = device.sensors.read().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["temp-01", "hum-01"]);
        assert_eq!(device.subjects().len(), 5);
        assert!(device.subjects().contains(&"iot.dev1.sensor.register".to_string()));
    }

    #[tokio::test]
    async fn test_get_config_and_status() {
        let device = device();

        let config = device.handle(RequestKind::Config, b"").await;
        assert_eq!(config["temp-01"]["type"], "temperature");
        assert_eq!(config["temp-01"]["min"], 20.0);
        assert_eq!(config["hum-01"]["enabled"], false);

        let status = device.handle(RequestKind::Status, b"").await;
        assert_eq!(status["device_id"], "dev1");
        assert_eq!(status["total"], 2);
        assert_eq!(status["enabled"], 1);
        assert_eq!(status["disabled"], 1);
        assert!(status["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_update_config_applies_all_paths() {
        let device = device();
        let response = device
            .handle(
                RequestKind::ConfigUpdate,
                br#"{"sensor_id": "temp-01", "frequency": "2s", "max": 40, "thresholds": {"min": 10}}"#,
            )
            .await;
        assert_eq!(response, json!({"status": "updated"}));

        let spec = device.sensor("temp-01").unwrap().snapshot();
        assert_eq!(spec.frequency, Duration::from_secs(2));
        assert_eq!(spec.min, 10.0);
        assert_eq!(spec.max, 40.0);

        // the other sensor is untouched
        assert_eq!(device.sensor("hum-01").unwrap().snapshot(), specs()[1]);
    }

    #[tokio::test]
    async fn test_update_config_ignores_malformed_optionals() {
        let device = device();
        let response = device
            .handle(
                RequestKind::ConfigUpdate,
                br#"{"sensor_id": "temp-01", "frequency": "whenever", "min": "low", "thresholds": {"max": 5}}"#,
            )
            .await;
        assert_eq!(response, json!({"status": "updated"}));

        // min stays 20 and max 5 would invert the range, so nothing changes
        assert_eq!(device.sensor("temp-01").unwrap().snapshot(), specs()[0]);
    }

    #[tokio::test]
    async fn test_update_config_errors() {
        let device = device();
        assert_eq!(
            device.handle(RequestKind::ConfigUpdate, b"{oops").await,
            json!({"error": "invalid JSON"})
        );
        assert_eq!(
            device.handle(RequestKind::ConfigUpdate, br#"{"frequency": "1s"}"#).await,
            json!({"error": "sensor_id is required"})
        );
        assert_eq!(
            device.handle(RequestKind::ConfigUpdate, br#"{"sensor_id": "nope"}"#).await,
            json!({"error": "sensor not found"})
        );
    }

    #[tokio::test]
    async fn test_register_with_defaults() {
        let device = device();
        let response = device
            .handle(RequestKind::Register, br#"{"sensor_id": "co2-01", "type": "co2"}"#)
            .await;

        assert_eq!(response["status"], "registered");
        assert_eq!(response["sensor_id"], "co2-01");
        assert_eq!(response["config"]["frequency"], "30s");
        assert_eq!(response["config"]["enabled"], true);
        assert_eq!(response["config"]["min"], 0.0);
        assert_eq!(response["config"]["max"], 100.0);
        assert_eq!(response["config"]["unit"], "");

        assert_eq!(device.sensor_count(), 3);
        assert_eq!(device.sensor("co2-01").unwrap().snapshot(), SensorSpec::new("co2-01", "co2"));
    }

    #[tokio::test]
    async fn test_register_conflict_leaves_collection_unchanged() {
        let device = device();
        let before = device.snapshot();

        let response = device
            .handle(RequestKind::Register, br#"{"sensor_id": "temp-01", "type": "pressure"}"#)
            .await;
        assert_eq!(response, json!({"error": "sensor already exists"}));
        assert_eq!(device.sensor_count(), 2);
        assert_eq!(device.snapshot(), before);

        assert_eq!(
            device.handle(RequestKind::Register, br#"{"sensor_id": "x", "type": ""}"#).await,
            json!({"error": "type is required"})
        );
        assert_eq!(device.sensor_count(), 2);
    }

    #[tokio::test]
    async fn test_register_rejects_inverted_range() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (device, _bus) = device_with(Some(db.clone()));
        let before = device.snapshot();

        // max falls back to the default 100
        let response = device
            .handle(RequestKind::Register, br#"{"sensor_id": "co2", "type": "co2", "min": 400}"#)
            .await;
        assert_eq!(response, json!({"error": "min must not exceed max"}));
        assert!(device.sensor("co2").is_none());
        assert_eq!(device.snapshot(), before);
        assert!(db.load_config("dev1").await.unwrap().is_none());

        let response = device
            .handle(RequestKind::Register, br#"{"sensor_id": "co2", "type": "co2", "min": 400, "max": 2000}"#)
            .await;
        assert_eq!(response["status"], "registered");
        assert!(device.sensor("co2").unwrap().snapshot().has_valid_range());
    }

    #[tokio::test]
    async fn test_update_config_checks_combined_thresholds() {
        let device = device();
        let response = device
            .handle(
                RequestKind::ConfigUpdate,
                br#"{"sensor_id": "temp-01", "min": 50, "thresholds": {"max": 60}}"#,
            )
            .await;
        assert_eq!(response, json!({"status": "updated"}));

        let spec = device.sensor("temp-01").unwrap().snapshot();
        assert_eq!((spec.min, spec.max), (50.0, 60.0));

        // nested keys win over top-level ones
        device
            .handle(
                RequestKind::ConfigUpdate,
                br#"{"sensor_id": "temp-01", "max": 55, "thresholds": {"max": 70}}"#,
            )
            .await;
        let spec = device.sensor("temp-01").unwrap().snapshot();
        assert_eq!((spec.min, spec.max), (50.0, 70.0));
    }

    #[tokio::test]
    async fn test_latest_reading_without_storage() {
        let device = device();
        assert_eq!(
            device.handle(RequestKind::LatestReading, br#"{"sensor_id": "temp-01"}"#).await,
            json!({"error": "storage not available"})
        );
        assert_eq!(
            device.handle(RequestKind::LatestReading, br#"{"sensor_id": "ghost"}"#).await,
            json!({"error": "sensor not found"})
        );
    }

    #[tokio::test]
    async fn test_latest_reading_from_store() {
        let db: Arc<dyn ReadingStore> = Arc::new(Database::open_in_memory().unwrap());
        let (device, _bus) = device_with(Some(db.clone()));

        assert_eq!(
            device.handle(RequestKind::LatestReading, br#"{"sensor_id": "temp-01"}"#).await,
            json!({"error": "no readings found"})
        );

        let sensor = device.sensor("temp-01").unwrap();
        let reading = Reading::sample(&sensor.snapshot(), 22.5);
        db.save_reading(&reading).await.unwrap();

        let response = device
            .handle(RequestKind::LatestReading, br#"{"sensor_id": "temp-01"}"#)
            .await;
        assert_eq!(response["sensor_id"], "temp-01");
        assert_eq!(response["latest_reading"]["value"], 22.5);
        assert_eq!(response["latest_reading"]["unit"], "°C");
    }

    #[tokio::test]
    async fn test_store_failures_are_contained() {
        let (device, _bus) = device_with(Some(Arc::new(FailingStore)));

        assert_eq!(
            device.handle(RequestKind::LatestReading, br#"{"sensor_id": "temp-01"}"#).await,
            json!({"error": "failed to retrieve readings"})
        );
        // config persistence fails silently
        assert_eq!(
            device.handle(RequestKind::ConfigUpdate, br#"{"sensor_id": "temp-01", "min": 21}"#).await,
            json!({"status": "updated"})
        );
        assert_eq!(
            device.handle(RequestKind::Register, br#"{"sensor_id": "p-01", "type": "pressure"}"#).await["status"],
            "registered"
        );
    }

    #[tokio::test]
    async fn test_config_snapshot_persisted() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (device, _bus) = device_with(Some(db.clone()));

        device
            .handle(RequestKind::Register, br#"{"sensor_id": "p-01", "type": "pressure", "unit": "hPa"}"#)
            .await;

        let stored = db.load_config("dev1").await.unwrap().unwrap();
        assert_eq!(stored, device.snapshot());
        assert_eq!(stored["p-01"].unit, "hPa");
    }

    #[tokio::test]
    async fn test_requests_over_bus() {
        let (device, bus) = device_with(None);
        let cancel = CancellationToken::new();
        device.start(cancel.clone()).await.unwrap();

        let reply = bus
            .request("iot.dev1.status", Vec::new(), Duration::from_secs(1))
            .await
            .unwrap();
        let status: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(status["total"], 2);

        let reply = bus
            .request("iot.dev1.config.update", b"not json".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        let error: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(error, json!({"error": "invalid JSON"}));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), device.join())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_sensor_runs_and_stops_on_shutdown() {
        let (device, bus) = device_with(None);
        let mut readings = bus.subscribe("iot.dev1.readings.>").await.unwrap();
        let cancel = CancellationToken::new();
        device.start(cancel.clone()).await.unwrap();

        let reply = bus
            .request(
                "iot.dev1.sensor.register",
                br#"{"sensor_id": "lux-01", "type": "light", "frequency": "1s"}"#.to_vec(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let response: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(response["status"], "registered");

        let first = readings.next().await.unwrap();
        assert_eq!(first.subject, "iot.dev1.readings.light.lux-01");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), device.join())
            .await
            .unwrap();
        assert!(device.tasks.lock().is_empty());
    }
}
