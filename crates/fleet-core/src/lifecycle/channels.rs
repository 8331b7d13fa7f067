//! Publish/subscribe channels between agents
//!
//! Each subscriber owns a bounded mailbox. Delivery never blocks the sender:
//! a full mailbox drops the message for that subscriber and a closed one is
//! unsubscribed. There is no ordering guarantee across subscribers.

use crate::error::{FleetError, FleetResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Subscribers whose mailbox was full
    pub dropped: Vec<String>,
    /// Subscribers whose receiver was gone; they are unsubscribed
    pub closed: Vec<String>,
}

struct Subscriber {
    id: String,
    tx: mpsc::Sender<Message>,
}

pub struct ChannelHub {
    channels: DashMap<String, Vec<Subscriber>>,
    capacity: usize,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Create a channel. Creating an existing channel is a no-op.
    pub fn create_channel(&self, name: &str) -> FleetResult<()> {
        if name.trim().is_empty() {
            return Err(FleetError::invalid_request("channel name must not be empty"));
        }
        self.channels.entry(name.to_string()).or_default();
        Ok(())
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn subscribers(&self, channel: &str) -> Vec<String> {
        self.channels
            .get(channel)
            .map(|subs| subs.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Subscribe `subscriber` to `channel` and return its mailbox. A repeated
    /// subscription replaces the previous mailbox.
    pub fn subscribe(&self, channel: &str, subscriber: &str) -> FleetResult<mpsc::Receiver<Message>> {
        let mut subs = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| FleetError::invalid_request(format!("unknown channel '{}'", channel)))?;
        let (tx, rx) = mpsc::channel(self.capacity);
        subs.retain(|s| s.id != subscriber);
        subs.push(Subscriber {
            id: subscriber.to_string(),
            tx,
        });
        Ok(rx)
    }

    pub fn unsubscribe(&self, channel: &str, subscriber: &str) -> bool {
        let Some(mut subs) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != subscriber);
        subs.len() != before
    }

    /// Drop `subscriber` from every channel
    pub fn remove_subscriber(&self, subscriber: &str) {
        for mut subs in self.channels.iter_mut() {
            subs.retain(|s| s.id != subscriber);
        }
    }

    /// Deliver to one subscriber of `channel`
    pub fn send_message(
        &self,
        channel: &str,
        to: &str,
        from: Option<&str>,
        payload: serde_json::Value,
    ) -> FleetResult<DeliveryReport> {
        self.deliver(channel, from, payload, Some(to))
    }

    /// Deliver to every subscriber of `channel` except the sender
    pub fn broadcast(
        &self,
        channel: &str,
        from: Option<&str>,
        payload: serde_json::Value,
    ) -> FleetResult<DeliveryReport> {
        self.deliver(channel, from, payload, None)
    }

    fn deliver(
        &self,
        channel: &str,
        from: Option<&str>,
        payload: serde_json::Value,
        only: Option<&str>,
    ) -> FleetResult<DeliveryReport> {
        let mut subs = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| FleetError::invalid_request(format!("unknown channel '{}'", channel)))?;

        if let Some(to) = only {
            if !subs.iter().any(|s| s.id == to) {
                return Err(FleetError::invalid_request(format!(
                    "'{}' is not subscribed to channel '{}'",
                    to, channel
                )));
            }
        }

        let message = Message {
            channel: channel.to_string(),
            from: from.map(str::to_string),
            payload,
            sent_at: Utc::now(),
        };

        let mut report = DeliveryReport::default();
        for sub in subs.iter() {
            if only.map_or(false, |to| to != sub.id) {
                continue;
            }
            if only.is_none() && from == Some(sub.id.as_str()) {
                continue;
            }
            match sub.tx.try_send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.dropped.push(sub.id.clone()),
                Err(TrySendError::Closed(_)) => report.closed.push(sub.id.clone()),
            }
        }
        if !report.closed.is_empty() {
            subs.retain(|s| !report.closed.contains(&s.id));
        }
        debug!(
            channel = %channel,
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "Message delivered"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let hub = ChannelHub::new(8);
        hub.create_channel("coord").unwrap();
        let mut a = hub.subscribe("coord", "a").unwrap();
        let mut b = hub.subscribe("coord", "b").unwrap();

        let report = hub.broadcast("coord", Some("a"), json!({"task": 1})).unwrap();
        assert_eq!(report.delivered, 1);

        let msg = b.recv().await.unwrap();
        assert_eq!(msg.from.as_deref(), Some("a"));
        assert_eq!(msg.payload["task"], 1);
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_direct_message() {
        let hub = ChannelHub::new(8);
        hub.create_channel("coord").unwrap();
        let mut a = hub.subscribe("coord", "a").unwrap();
        let mut b = hub.subscribe("coord", "b").unwrap();

        hub.send_message("coord", "b", None, json!("hi")).unwrap();
        assert_eq!(b.recv().await.unwrap().payload, json!("hi"));
        assert!(a.try_recv().is_err());

        assert!(hub.send_message("coord", "c", None, json!("hi")).is_err());
    }

    #[test]
    fn test_full_mailbox_drops_and_closed_unsubscribes() {
        let hub = ChannelHub::new(1);
        hub.create_channel("coord").unwrap();
        let _a = hub.subscribe("coord", "a").unwrap();
        let b = hub.subscribe("coord", "b").unwrap();
        drop(b);

        hub.broadcast("coord", None, json!(1)).unwrap();
        let report = hub.broadcast("coord", None, json!(2)).unwrap();
        assert_eq!(report.dropped, vec!["a".to_string()]);
        assert!(report.closed.is_empty());
        assert_eq!(hub.subscribers("coord"), vec!["a".to_string()]);
    }

    #[test]
    fn test_unknown_channel() {
        let hub = ChannelHub::new(4);
        assert!(hub.subscribe("nope", "a").is_err());
        assert!(hub.broadcast("nope", None, json!(null)).is_err());
        assert!(hub.create_channel(" ").is_err());
    }
}
