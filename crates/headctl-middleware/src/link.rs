//! The broker seam.
//!
//! The orchestration daemon never speaks a broker protocol directly. It
//! talks to a [`BrokerLink`], which hands it a stream of [`LinkEvent`]s and
//! accepts subscribe/publish calls.
//!
//! - [`MqttLink`][crate::mqtt::MqttLink] – a real MQTT broker.
//! - [`MemoryLink`] – loopback over an in-process [`MessageBus`], used for
//!   offline runs and tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use headctl_types::HeadError;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{Message, MessageBus};

/// Something that happened on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// (Re)connected. Subscriptions must be renewed and status republished.
    Connected,
    /// The connection dropped; the link is retrying on its own.
    Disconnected(HeadError),
    /// An inbound message on a subscribed topic.
    Message(Message),
}

/// Every broker connection implements this trait.
///
/// # Contract
///
/// * `events` – the inbound event stream. It can be taken once; later calls
///   return an empty stream.
/// * `subscribe` / `publish` – fire requests at the broker. Errors mean the
///   request never left this process.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn subscribe(&self, filter: &str) -> Result<(), HeadError>;

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), HeadError>;

    fn events(&self) -> BoxStream<'static, LinkEvent>;
}

/// Turn a one-shot receiver slot into an event stream.
pub(crate) fn take_stream(
    slot: &Mutex<Option<mpsc::Receiver<LinkEvent>>>,
) -> BoxStream<'static, LinkEvent> {
    match slot.lock().take() {
        Some(rx) => stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed(),
        None => stream::empty().boxed(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MemoryLink
// ────────────────────────────────────────────────────────────────────────────

/// Loopback link over a shared [`MessageBus`].
///
/// Connects immediately. The configured last-will is published to the bus by
/// [`MemoryLink::drop_abnormally`], mirroring what a broker does when a
/// client vanishes.
pub struct MemoryLink {
    bus: MessageBus,
    tx: mpsc::Sender<LinkEvent>,
    rx: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
    will: Option<Message>,
}

impl MemoryLink {
    pub fn connect(bus: MessageBus, will: Option<Message>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        // Capacity is non-zero and the receiver is alive, so this cannot fail.
        let _ = tx.try_send(LinkEvent::Connected);
        Self {
            bus,
            tx,
            rx: Mutex::new(Some(rx)),
            will,
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Simulate an unclean disconnect: publish the last-will.
    pub fn drop_abnormally(self) {
        if let Some(will) = self.will {
            self.bus.publish(will);
        }
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn subscribe(&self, filter: &str) -> Result<(), HeadError> {
        let mut subscriber = self.bus.subscribe(filter);
        let tx = self.tx.clone();
        debug!(filter, "memory link subscribed");
        tokio::spawn(async move {
            while let Ok(message) = subscriber.recv().await {
                if tx.send(LinkEvent::Message(message)).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), HeadError> {
        self.bus.publish(Message::new(topic, payload, retain));
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, LinkEvent> {
        take_stream(&self.rx)
    }
}
