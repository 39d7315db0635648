//! Fan-out of agent actions to live viewers.
//!
//! Each subscriber is a bounded channel drained by its WebSocket task.
//! Delivery is an awaited `send_timeout` on every channel in turn, so a slow
//! viewer costs the tick at most `send_timeout` per message. Channels that
//! are closed or time out are dropped from the set at the end of the pass.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::config::BroadcastConfig;

pub type SubscriberId = u64;

/// One message on the live stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamMessage {
    Action(ActionUpdate),
    Reset(ResetNotice),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionUpdate {
    pub agent_id: String,
    pub marker: String,
    /// Present only when the agent moved this tick
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetNotice {
    #[serde(rename = "type")]
    pub kind: String,
}

impl StreamMessage {
    pub fn action(agent_id: &str, marker: &str, zone: Option<&str>) -> Self {
        Self::Action(ActionUpdate {
            agent_id: agent_id.to_string(),
            marker: marker.to_string(),
            zone: zone.map(str::to_string),
        })
    }

    pub fn reset() -> Self {
        Self::Reset(ResetNotice {
            kind: "reset".to_string(),
        })
    }
}

/// Result of one delivery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub pruned: usize,
}

pub struct Broadcaster {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<StreamMessage>>>,
    next_id: AtomicU64,
    send_timeout: Duration,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(config: &BroadcastConfig) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            send_timeout: config.send_timeout(),
            capacity: config.channel_capacity.max(1),
        }
    }

    /// Register a new viewer. It receives only messages sent after this call.
    pub async fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<StreamMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().await.insert(id, tx);
        debug!(subscriber = id, "viewer subscribed");
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers.lock().await.remove(&id).is_some() {
            debug!(subscriber = id, "viewer unsubscribed");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    pub async fn broadcast(&self, agent_id: &str, marker: &str, zone: Option<&str>) -> Delivery {
        self.deliver(StreamMessage::action(agent_id, marker, zone))
            .await
    }

    pub async fn broadcast_reset(&self) -> Delivery {
        self.deliver(StreamMessage::reset()).await
    }

    async fn deliver(&self, message: StreamMessage) -> Delivery {
        // Snapshot the set so the lock is not held across sends.
        let targets: Vec<(SubscriberId, mpsc::Sender<StreamMessage>)> = self
            .subscribers
            .lock()
            .await
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivery = Delivery::default();
        let mut stale = Vec::new();

        for (id, tx) in targets {
            match tx.send_timeout(message.clone(), self.send_timeout).await {
                Ok(()) => delivery.delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    debug!(subscriber = id, "viewer too slow, dropping");
                    stale.push(id);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(subscriber = id, "viewer channel closed, dropping");
                    stale.push(id);
                }
            }
        }

        if !stale.is_empty() {
            let mut subscribers = self.subscribers.lock().await;
            for id in &stale {
                if subscribers.remove(id).is_some() {
                    delivery.pruned += 1;
                }
            }
        }

        delivery
    }
}
