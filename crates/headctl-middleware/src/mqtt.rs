//! [`MqttLink`] – MQTT broker connection.
//!
//! * Registers the retained last-will (`{"online":false}` on the status
//!   topic) at connect time so subscribers learn of unclean shutdowns.
//! * Surfaces every `CONNACK` as [`LinkEvent::Connected`]; the daemon
//!   re-subscribes and republishes status on each one.
//! * On connection errors, reports [`LinkEvent::Disconnected`] and retries
//!   with exponential backoff (1 s doubling to 30 s, reset on success).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use headctl_types::HeadError;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::Message;
use crate::link::{BrokerLink, LinkEvent, take_stream};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Connection parameters for [`MqttLink::connect`].
#[derive(Clone)]
pub struct MqttSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Published by the broker if this client disappears uncleanly.
    pub will: Message,
}

impl std::fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSettings")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("keep_alive", &self.keep_alive)
            .field("will", &self.will.topic)
            .finish()
    }
}

impl MqttSettings {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_last_will(LastWill::new(
            self.will.topic.clone(),
            self.will.payload.to_vec(),
            QoS::AtLeastOnce,
            self.will.retain,
        ));
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

pub struct MqttLink {
    client: AsyncClient,
    rx: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
    driver: JoinHandle<()>,
}

impl MqttLink {
    /// Create the client and start driving its event loop in the background.
    ///
    /// Returns immediately; the connection is established asynchronously and
    /// announced as [`LinkEvent::Connected`].
    pub fn connect(settings: &MqttSettings) -> Self {
        let (client, eventloop) = AsyncClient::new(settings.options(), 64);
        let (tx, rx) = mpsc::channel(256);
        info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "connecting to broker");
        let driver = tokio::spawn(drive(eventloop, tx));
        Self {
            client,
            rx: Mutex::new(Some(rx)),
            driver,
        }
    }

    /// Disconnect cleanly. The broker does not publish the last-will.
    pub async fn disconnect(&self) -> Result<(), HeadError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| HeadError::BrokerDisconnect(e.to_string()))
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn subscribe(&self, filter: &str) -> Result<(), HeadError> {
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| HeadError::BrokerDisconnect(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), HeadError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .await
            .map_err(|e| HeadError::BrokerDisconnect(e.to_string()))
    }

    fn events(&self) -> BoxStream<'static, LinkEvent> {
        take_stream(&self.rx)
    }
}

/// Next reconnect delay after `current` failed.
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

async fn drive(mut eventloop: EventLoop, tx: mpsc::Sender<LinkEvent>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(code = ?ack.code, "broker connected");
                backoff = INITIAL_BACKOFF;
                LinkEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "broker message");
                LinkEvent::Message(Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    retain: publish.retain,
                })
            }
            Ok(_) => continue,
            Err(e) => {
                let err = HeadError::BrokerDisconnect(e.to_string());
                warn!(error = %err, retry_in_ms = backoff.as_millis() as u64, "broker connection lost");
                if tx.send(LinkEvent::Disconnected(err)).await.is_err() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        if tx.send(event).await.is_err() {
            debug!("link event receiver dropped; stopping broker driver");
            return;
        }
    }
}
