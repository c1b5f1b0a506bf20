// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! Per-sensor runtime: synthetic readings on a timer

use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{valid_range, Reading, SensorSpec, ThresholdUpdate, SENSOR_ERROR_MESSAGE};
use crate::bus::{readings_subject, Bus};
use crate::config::ReadingsTopic;
use crate::db::ReadingStore;

/// Probability that a tick yields a communication error instead of a value
pub const FAILURE_RATE: f64 = 0.05;

/// Simulates one sensor. The spec sits behind a reader/writer lock so that
/// request handlers can inspect and reconfigure it while the loop runs.
pub struct SensorRuntime {
    id: String,
    spec: RwLock<SensorSpec>,
    bus: Arc<dyn Bus>,
    store: Option<Arc<dyn ReadingStore>>,
    topic: ReadingsTopic,
}

impl SensorRuntime {
    pub fn new(
        spec: SensorSpec,
        bus: Arc<dyn Bus>,
        store: Option<Arc<dyn ReadingStore>>,
        topic: ReadingsTopic,
    ) -> Self {
        Self {
            id: spec.id.clone(),
            spec: RwLock::new(spec),
            bus,
            store,
            topic,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.spec.read().enabled
    }

    /// Copy of the current spec
    pub fn snapshot(&self) -> SensorSpec {
        self.spec.read().clone()
    }

    /// Run the sampling loop until `cancel` fires. Disabled sensors return at once.
    pub async fn start(&self, cancel: CancellationToken, device_id: &str) {
        let initial = self.snapshot();
        if !initial.enabled {
            info!("Sensor {} is disabled, not starting", self.id);
            return;
        }

        info!("Starting sensor {} with frequency {:?}", self.id, initial.frequency);

        let mut deadline = Instant::now() + initial.frequency;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            if cancel.is_cancelled() {
                break;
            }

            let reading = self.generate_reading();
            self.publish(&reading, device_id).await;

            // Frequency updates apply from the next tick on. A late tick
            // restarts the schedule instead of bursting to catch up.
            let period = self.spec.read().frequency;
            let now = Instant::now();
            deadline += period;
            if deadline <= now {
                deadline = now + period;
            }
        }

        info!("Stopping sensor {}", self.id);
    }

    /// One sample: a communication error with probability [`FAILURE_RATE`],
    /// otherwise a value uniformly drawn from `[min, max]`.
    pub fn generate_reading(&self) -> Reading {
        let spec = self.spec.read();
        let mut rng = rand::thread_rng();

        if rng.gen_bool(FAILURE_RATE) {
            return Reading::failure(&spec, SENSOR_ERROR_MESSAGE);
        }

        // Weighted form stays finite even when max - min would overflow
        let unit: f64 = rng.gen();
        let value = spec.min * (1.0 - unit) + spec.max * unit;
        Reading::sample(&spec, value.max(spec.min).min(spec.max))
    }

    /// Publish on the bus, then hand the reading to the store when one is
    /// configured. Persistence runs on its own task so a slow store never
    /// delays the next tick. Failures are logged and swallowed.
    pub async fn publish(&self, reading: &Reading, device_id: &str) {
        let subject = readings_subject(device_id, reading, self.topic);

        match serde_json::to_vec(reading) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&subject, payload).await {
                    warn!("Error publishing reading from {}: {}", reading.sensor_id, e);
                } else {
                    debug!(subject = %subject, "Published reading");
                }
            }
            Err(e) => warn!("Error encoding reading from {}: {}", reading.sensor_id, e),
        }

        if let Some(store) = &self.store {
            let store = store.clone();
            let reading = reading.clone();
            tokio::spawn(async move {
                if let Err(e) = store.save_reading(&reading).await {
                    warn!("Error saving reading to storage: {}", e);
                }
            });
        }
    }

    /// New sampling period, picked up when the loop next re-arms
    pub fn update_frequency(&self, frequency: Duration) {
        self.spec.write().frequency = frequency;
        info!("Sensor {} frequency updated to {:?}", self.id, frequency);
    }

    /// Apply whichever bounds are present. An update that would leave
    /// `min > max` or a non-finite bound is dropped whole.
    /// Returns whether anything changed.
    pub fn update_thresholds(&self, update: ThresholdUpdate) -> bool {
        if update.is_empty() {
            return false;
        }

        let mut spec = self.spec.write();
        let (min, max) = update.apply_to(spec.min, spec.max);
        if !valid_range(min, max) {
            warn!(
                "Sensor {} rejected thresholds min={} max={}: bounds must be finite with min <= max",
                self.id, min, max
            );
            return false;
        }

        spec.min = min;
        spec.max = max;
        info!("Sensor {} thresholds updated: min={:.2}, max={:.2}", self.id, min, max);
        true
    }
}
