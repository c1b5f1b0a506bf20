// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! In-process bus for single-binary runs and tests

use async_trait::async_trait;
use parking_lot::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{subject_matches, Bus, BusError, BusMessage, Subscription};

struct LocalSubscriber {
    pattern: String,
    tx: mpsc::Sender<BusMessage>,
}

/// Central in-memory bus for pub/sub and request/response
pub struct LocalBus {
    subscribers: RwLock<Vec<LocalSubscriber>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Send a request and wait for the first reply
    pub async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<BusMessage, BusError> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let mut replies = self.subscribe(&inbox).await?;

        let delivered = self.deliver(BusMessage {
            subject: subject.to_string(),
            payload,
            reply: Some(inbox.clone()),
        });

        let result = if delivered == 0 {
            Err(BusError::NoResponders(subject.to_string()))
        } else {
            tokio::time::timeout(timeout, replies.next())
                .await
                .map_err(|_| BusError::Timeout(timeout))
                .and_then(|reply| reply.ok_or(BusError::Closed))
        };

        self.unsubscribe(&inbox);
        result
    }

    /// Drop every subscriber registered on exactly `pattern`
    fn unsubscribe(&self, pattern: &str) {
        self.subscribers.write().retain(|s| s.pattern != pattern);
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    /// Hand a message to every matching subscriber, returning how many took it
    fn deliver(&self, message: BusMessage) -> usize {
        let mut delivered = 0;
        let mut stale = false;

        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter() {
                if !subject_matches(&subscriber.pattern, &message.subject) {
                    continue;
                }
                match subscriber.tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(subject = %message.subject, "Subscriber queue full, dropping message");
                    }
                    Err(TrySendError::Closed(_)) => stale = true,
                }
            }
        }

        if stale {
            self.subscribers.write().retain(|s| !s.tx.is_closed());
        }

        delivered
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let delivered = self.deliver(BusMessage {
            subject: subject.to_string(),
            payload,
            reply: None,
        });
        debug!(subject, delivered, "Published");
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        {
            let mut subscribers = self.subscribers.write();
            subscribers.retain(|s| !s.tx.is_closed());
            subscribers.push(LocalSubscriber {
                pattern: subject.to_string(),
                tx,
            });
        }
        debug!(subject, "Subscribed");
        Ok(Subscription::new(subject, rx))
    }

    async fn respond(&self, reply_to: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.publish(reply_to, payload).await
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
