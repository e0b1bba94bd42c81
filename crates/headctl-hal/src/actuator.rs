//! [`ActuatorEndpoint`] trait for the gaze and mouth controllers.
//!
//! Drivers implement this trait and register themselves with an
//! [`EndpointRegistry`][crate::registry::EndpointRegistry]. The control loop
//! only ever talks to the trait, so the UDP link can be swapped for a
//! simulator without touching arbitration or playback logic.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use headctl_types::{ActuatorCommand, ActuatorTarget, HeadError};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::codec;

/// A physical actuator controller reachable over some link.
///
/// Delivery is fire-and-forget: an `Ok` return means the command left this
/// process, not that the controller applied it.
#[async_trait]
pub trait ActuatorEndpoint: Send + Sync {
    /// The target this endpoint drives.
    fn target(&self) -> ActuatorTarget;

    /// Deliver `command` to the controller.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::Transport`] if the command could not be handed to
    /// the link.
    async fn send(&self, command: &ActuatorCommand) -> Result<(), HeadError>;
}

/// Endpoint that writes each command as a single UDP datagram.
pub struct UdpEndpoint {
    target: ActuatorTarget,
    peer: SocketAddr,
    socket: UdpSocket,
}

impl UdpEndpoint {
    /// Bind an ephemeral local socket for talking to the controller at `peer`.
    pub async fn bind(target: ActuatorTarget, peer: SocketAddr) -> Result<Self, HeadError> {
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await.map_err(|e| HeadError::Transport {
            target,
            details: format!("bind failed: {e}"),
        })?;
        debug!(%target, %peer, "actuator endpoint bound");
        Ok(Self {
            target,
            peer,
            socket,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl ActuatorEndpoint for UdpEndpoint {
    fn target(&self) -> ActuatorTarget {
        self.target
    }

    async fn send(&self, command: &ActuatorCommand) -> Result<(), HeadError> {
        let datagram = codec::encode(command);
        self.socket
            .send_to(&datagram, self.peer)
            .await
            .map(|_| ())
            .map_err(|e| HeadError::Transport {
                target: self.target,
                details: e.to_string(),
            })
    }
}
