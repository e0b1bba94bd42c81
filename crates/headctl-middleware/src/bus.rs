//! In-process publish/subscribe bus with retained messages.
//!
//! Uses a [`tokio::sync::broadcast`] channel under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others. Subscribers filter by MQTT-style topic patterns:
//!
//! | Filter | Matches |
//! |---|---|
//! | `robot/head/status` | exactly that topic |
//! | `robot/+/status` | one level wildcard |
//! | `robot/head/#` | the whole subtree, including `robot/head` |
//!
//! A message published with `retain = true` is also stored per topic and
//! replayed to every later subscriber whose filter matches. Publishing an
//! empty retained payload clears the stored message.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use headctl_types::HeadError;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered messages before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }
}

/// Does `topic` match the MQTT-style `filter`?
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Shared message bus. Clone it cheaply; all clones share the same channel
/// and retained store.
#[derive(Clone, Debug)]
pub struct MessageBus {
    sender: broadcast::Sender<Message>,
    retained: Arc<Mutex<HashMap<String, Message>>>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            retained: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish `message`, storing it first when it is retained.
    ///
    /// Returns the number of live subscribers handed the message; `0` when
    /// nobody is listening is a normal condition.
    pub fn publish(&self, message: Message) -> usize {
        if message.retain {
            let mut retained = self.retained.lock();
            if message.payload.is_empty() {
                retained.remove(&message.topic);
            } else {
                retained.insert(message.topic.clone(), message.clone());
            }
        }
        self.sender.send(message).unwrap_or(0)
    }

    /// The retained message for `topic`, if any.
    pub fn retained(&self, topic: &str) -> Option<Message> {
        self.retained.lock().get(topic).cloned()
    }

    /// Subscribe to every topic matching `filter`. Matching retained messages
    /// are delivered first.
    pub fn subscribe(&self, filter: impl Into<String>) -> TopicSubscriber {
        let filter = filter.into();
        let receiver = self.sender.subscribe();
        let mut backlog: Vec<Message> = self
            .retained
            .lock()
            .values()
            .filter(|m| topic_matches(&filter, &m.topic))
            .cloned()
            .collect();
        backlog.sort_by(|a, b| a.topic.cmp(&b.topic));
        TopicSubscriber {
            filter,
            backlog: backlog.into(),
            receiver,
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A subscriber that only delivers messages matching its topic filter.
pub struct TopicSubscriber {
    filter: String,
    backlog: VecDeque<Message>,
    receiver: broadcast::Receiver<Message>,
}

impl TopicSubscriber {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Wait for the next matching message.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::Channel`] once the bus has shut down.
    pub async fn recv(&mut self) -> Result<Message, HeadError> {
        if let Some(message) = self.backlog.pop_front() {
            return Ok(message);
        }
        loop {
            match self.receiver.recv().await {
                Ok(message) if topic_matches(&self.filter, &message.topic) => {
                    return Ok(message);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(filter = %self.filter, lagged_by = n, "TopicSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(HeadError::Channel("message bus closed".to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn filter_matching() {
        assert!(topic_matches("robot/head/status", "robot/head/status"));
        assert!(topic_matches("robot/+/status", "robot/head/status"));
        assert!(topic_matches("robot/head/#", "robot/head/animation/play"));
        assert!(topic_matches("robot/head/#", "robot/head"));
        assert!(!topic_matches("robot/+/status", "robot/head/animation/stop"));
        assert!(!topic_matches("robot/head", "robot/head/status"));
        assert!(!topic_matches("robot/head/status", "robot/head"));
    }

    #[tokio::test]
    async fn subscriber_filters() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::default();
        let mut sub = bus.subscribe("robot/head/animation/+");

        bus.publish(Message::new("robot/head/system", "{}", false));
        bus.publish(Message::new("robot/head/animation/stop", "{}", false));

        let got = sub.recv().await?;
        assert_eq!(got.topic, "robot/head/animation/stop");
        Ok(())
    }

    #[tokio::test]
    async fn retained_message_replayed_to_late_subscriber() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::default();
        assert_eq!(bus.publish(Message::new("robot/head/status", "old", true)), 0);
        bus.publish(Message::new("robot/head/status", "new", true));

        let mut late = bus.subscribe("robot/head/status");
        assert_eq!(late.recv().await?.payload, Bytes::from_static(b"new"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_retained_payload_clears() {
        let bus = MessageBus::default();
        bus.publish(Message::new("t", "x", true));
        bus.publish(Message::new("t", Bytes::new(), true));
        assert!(bus.retained("t").is_none());

        let mut sub = bus.subscribe("t");
        let result = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err(), "nothing retained, nothing live");
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_message() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::default();
        let mut a = bus.subscribe("#");
        let mut b = bus.subscribe("robot/#");
        assert_eq!(bus.publish(Message::new("robot/x", "1", false)), 2);
        assert_eq!(a.recv().await?.topic, "robot/x");
        assert_eq!(b.recv().await?.topic, "robot/x");
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_skips_lagged_messages() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MessageBus::new(4);
        let mut slow = bus.subscribe("flood");
        for i in 0..100u8 {
            bus.publish(Message::new("flood", vec![i], false));
        }
        // Lag is logged and skipped; the newest messages are still delivered.
        let got = slow.recv().await?;
        assert_eq!(got.payload[0], 96);
        Ok(())
    }
}
