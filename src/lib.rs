// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! IoTSim - virtual IoT device simulator
//!
//! A device owns a set of virtual sensors. Each sensor samples on its own timer
//! and publishes synthetic readings on a publish/subscribe bus, and the device
//! answers configuration, status, registration and reading queries on the same
//! bus.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                DeviceRuntime                 │
//! │   request handlers   ┌────────────────────┐  │
//! │   config / status /  │ SensorRuntime × N  │  │
//! │   update / register  │ (one task each)    │  │
//! │   / latest           └────────────────────┘  │
//! └──────────┬─────────────────────┬─────────────┘
//!            ↓                     ↓
//!    ┌──────────────┐      ┌───────────────┐
//!    │ Bus          │      │ ReadingStore  │
//!    │ local / MQTT │      │ SQLite        │
//!    └──────────────┘      └───────────────┘
//! ```

pub mod bus;
pub mod config;
pub mod db;
pub mod device;
pub mod sensors;

// Re-exports for convenience
pub use bus::{Bus, LocalBus, MqttBus};
pub use config::Config;
pub use db::{Database, ReadingStore};
pub use device::DeviceRuntime;
pub use sensors::{Reading, SensorRuntime, SensorSpec};

/// IoTSim version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// IoTSim name
pub const NAME: &str = "IoTSim";
