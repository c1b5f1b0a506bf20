// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! Bus module - publish/subscribe transport used by the device
//!
//! Two transports are provided: [`LocalBus`] keeps everything in-process, and
//! [`MqttBus`] talks to an MQTT broker. The device only ever sees the [`Bus`]
//! trait.

mod local;
mod mqtt;

pub use local::LocalBus;
pub use mqtt::MqttBus;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ReadingsTopic;
use crate::sensors::Reading;

/// Transport failures
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,
    #[error("no responders for {0}")]
    NoResponders(String),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("MQTT {operation} failed: {message}")]
    Mqtt {
        operation: &'static str,
        message: String,
    },
}

/// A message delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Where a response should be sent, when the sender expects one
    pub reply: Option<String>,
}

/// Stream of messages for one subscribed subject
pub struct Subscription {
    subject: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub(crate) fn new(subject: &str, rx: mpsc::Receiver<BusMessage>) -> Self {
        Self {
            subject: subject.to_string(),
            rx,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the transport has gone away
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Next message if one is already queued
    pub fn try_next(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

/// Publish/subscribe transport with request/response support
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Start receiving messages sent to `subject`
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Answer a request on its reply subject
    async fn respond(&self, reply_to: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Release the transport
    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }

    /// Transport name for logging
    fn name(&self) -> &'static str;
}

/// Subject a reading is published on
pub fn readings_subject(device_id: &str, reading: &Reading, layout: ReadingsTopic) -> String {
    match layout {
        ReadingsTopic::PerType => {
            format!("iot.{}.readings.{}", device_id, reading.sensor_type)
        }
        ReadingsTopic::PerSensor => format!(
            "iot.{}.readings.{}.{}",
            device_id, reading.sensor_type, reading.sensor_id
        ),
    }
}

/// NATS-style subject matching on `.`-separated tokens.
/// `*` matches exactly one token, a trailing `>` matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
