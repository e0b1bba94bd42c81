//! `headctl-middleware` – The link to the outside world.
//!
//! Carries operator requests in and status out without caring what the
//! payloads mean.
//!
//! # Modules
//!
//! - [`bus`] – in-process, retained-message publish/subscribe bus built on
//!   Tokio broadcast channels, with MQTT-style topic filters.
//! - [`topics`] – the `robot/{id}/...` namespace.
//! - [`link`] – the [`BrokerLink`] trait and [`MemoryLink`], a loopback link
//!   over a [`MessageBus`].
//! - [`mqtt`] – [`MqttLink`][mqtt::MqttLink]: a real broker connection with
//!   last-will registration and reconnect backoff.

pub mod bus;
pub mod link;
pub mod mqtt;
pub mod topics;

pub use bus::{Message, MessageBus, TopicSubscriber, topic_matches};
pub use link::{BrokerLink, LinkEvent, MemoryLink};
pub use mqtt::{MqttLink, MqttSettings};
pub use topics::{InboundTopic, TopicSet};
