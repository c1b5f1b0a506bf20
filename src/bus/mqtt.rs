// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! MQTT transport
//!
//! Subjects are used verbatim as MQTT topics. Request/response rides on topic
//! suffixes: a request for subject `S` is published to `S/<correlation-id>`
//! and answered on `S/<correlation-id>/reply`. Messages on the bare subject
//! carry no reply address.

use async_trait::async_trait;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Bus, BusError, BusMessage, Subscription};
use crate::config::BusConfig;

const REPLY_SUFFIX: &str = "reply";

struct Route {
    subject: String,
    tx: mpsc::Sender<BusMessage>,
}

/// MQTT client wrapper implementing [`Bus`]
pub struct MqttBus {
    client: AsyncClient,
    routes: Arc<RwLock<Vec<Route>>>,
    broker: String,
    port: u16,
    stop: CancellationToken,
}

impl MqttBus {
    pub fn connect(config: &BusConfig, broker: &str, device_id: &str) -> Self {
        let client_id = config
            .mqtt_client_id
            .clone()
            .unwrap_or_else(|| format!("iotsim-{}", device_id));

        let mut options = MqttOptions::new(client_id, broker, config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        if let (Some(username), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        let routes: Arc<RwLock<Vec<Route>>> = Arc::new(RwLock::new(Vec::new()));
        let stop = CancellationToken::new();

        // Spawn eventloop handler
        let dispatch = routes.clone();
        let resubscribe = client.clone();
        let halt = stop.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = halt.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        // Clean sessions drop subscriptions on reconnect
                        for subject in dispatch.read().iter().map(|r| r.subject.clone()) {
                            for filter in filters(&subject) {
                                if let Err(e) = resubscribe.try_subscribe(filter, QoS::AtLeastOnce) {
                                    warn!("MQTT resubscribe to {} failed: {}", subject, e);
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        debug!("MQTT received: {:?}", msg.topic);
                        route(&dispatch, &msg.topic, msg.payload.to_vec());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
            debug!("MQTT event loop stopped");
        });

        info!("MQTT client initialized for {}:{}", broker, config.mqtt_port);

        Self {
            client,
            routes,
            broker: broker.to_string(),
            port: config.mqtt_port,
            stop,
        }
    }

    pub fn broker(&self) -> (&str, u16) {
        (&self.broker, self.port)
    }
}

/// Topic filters serving one subject: plain publishes and correlated requests
fn filters(subject: &str) -> [String; 2] {
    [subject.to_string(), format!("{}/+", subject)]
}

/// Split an incoming topic into the subscribed subject and an optional reply topic
fn classify(subject: &str, topic: &str) -> Option<Option<String>> {
    if topic == subject {
        return Some(None);
    }
    let correlation = topic.strip_prefix(subject)?.strip_prefix('/')?;
    if correlation.is_empty() || correlation.contains('/') {
        return None;
    }
    Some(Some(format!("{}/{}", topic, REPLY_SUFFIX)))
}

fn route(routes: &RwLock<Vec<Route>>, topic: &str, payload: Vec<u8>) {
    for route in routes.read().iter() {
        let Some(reply) = classify(&route.subject, topic) else {
            continue;
        };
        let message = BusMessage {
            subject: route.subject.clone(),
            payload: payload.clone(),
            reply,
        };
        if let Err(e) = route.tx.try_send(message) {
            warn!("Dropping MQTT message on {}: {}", topic, e);
        }
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(subject, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::Mqtt {
                operation: "publish",
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(256);
        self.routes.write().push(Route {
            subject: subject.to_string(),
            tx,
        });

        for filter in filters(subject) {
            self.client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(|e| BusError::Mqtt {
                    operation: "subscribe",
                    message: e.to_string(),
                })?;
        }

        info!("Subscribed to MQTT topic: {}", subject);
        Ok(Subscription::new(subject, rx))
    }

    async fn respond(&self, reply_to: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.publish(reply_to, payload).await
    }

    async fn close(&self) -> Result<(), BusError> {
        let result = self.client.disconnect().await.map_err(|e| BusError::Mqtt {
            operation: "disconnect",
            message: e.to_string(),
        });
        self.stop.cancel();
        result
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_topics() {
        let subject = "iot.dev1.config";
        assert_eq!(classify(subject, "iot.dev1.config"), Some(None));
        assert_eq!(
            classify(subject, "iot.dev1.config/abc123"),
            Some(Some("iot.dev1.config/abc123/reply".to_string()))
        );
        assert_eq!(classify(subject, "iot.dev1.config.update"), None);
        assert_eq!(classify(subject, "iot.dev1.config/abc123/reply"), None);
        assert_eq!(classify(subject, "iot.dev1.config/"), None);
    }

    #[tokio::test]
    async fn test_route_dispatches_requests() {
        let routes = RwLock::new(Vec::new());
        let (tx, mut rx) = mpsc::channel(4);
        routes.write().push(Route {
            subject: "iot.dev1.status".to_string(),
            tx,
        });

        route(&routes, "iot.dev1.status/42", b"{}".to_vec());
        route(&routes, "iot.dev1.config/42", b"{}".to_vec());

        let message = rx.recv().await.unwrap();
        assert_eq!(message.subject, "iot.dev1.status");
        assert_eq!(message.reply.as_deref(), Some("iot.dev1.status/42/reply"));
        assert!(rx.try_recv().is_err());
    }
}
