//! Live manual-control ingress.
//!
//! An operator console streams the same opcode datagrams the actuators
//! understand. `Claim` / `Relinquish` become handoff signals for the
//! `Remote` source; position and blink commands are forwarded to the control
//! loop, which drops them unless `Remote` currently holds a claim.
//!
//! Position datagrams (gaze, eyelids, mouth) pass a `governor` rate limiter
//! first so a runaway console cannot flood the intent queue. Handoffs and
//! blink edges are never limited.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use headctl_hal::codec;
use headctl_types::HeadError;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::control_loop::LoopIntent;

pub const DEFAULT_RATE_PER_SEC: u32 = 200;

const INITIAL_RECV_RETRY: Duration = Duration::from_millis(10);
const MAX_RECV_RETRY: Duration = Duration::from_secs(1);

/// Pause after a failed receive: doubles from 10 ms up to 1 s.
pub fn next_recv_retry(current: Duration) -> Duration {
    (current * 2).min(MAX_RECV_RETRY)
}

pub struct RemoteIngress {
    socket: UdpSocket,
    limiter: DefaultDirectRateLimiter,
    intents: mpsc::Sender<LoopIntent>,
}

impl RemoteIngress {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::FatalStartup`] if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        rate_per_sec: u32,
        intents: mpsc::Sender<LoopIntent>,
    ) -> Result<Self, HeadError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| HeadError::FatalStartup(format!("remote control listener {addr}: {e}")))?;
        let rate = NonZeroU32::new(rate_per_sec).unwrap_or(NonZeroU32::MIN);
        Ok(Self {
            socket,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            intents,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HeadError> {
        self.socket.local_addr().map_err(|e| HeadError::Io(e.to_string()))
    }

    /// Receive until the control loop goes away.
    pub async fn run(self) {
        let mut buf = [0u8; 64];
        if let Ok(addr) = self.socket.local_addr() {
            info!(%addr, "remote control ingress listening");
        }
        let mut retry = INITIAL_RECV_RETRY;
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => {
                    retry = INITIAL_RECV_RETRY;
                    received
                }
                Err(e) => {
                    warn!(error = %e, retry_in_ms = retry.as_millis() as u64, "remote control receive failed");
                    tokio::time::sleep(retry).await;
                    retry = next_recv_retry(retry);
                    continue;
                }
            };

            let command = match codec::decode(&buf[..len]) {
                Ok(command) => command,
                Err(e) => {
                    warn!(%peer, error = %e, "remote datagram discarded");
                    continue;
                }
            };

            if command.is_positional() && self.limiter.check().is_err() {
                debug!(%peer, ?command, "remote datagram over rate limit");
                continue;
            }

            if self.intents.send(LoopIntent::Remote(command)).await.is_err() {
                break;
            }
        }
        info!("remote control ingress stopped");
    }
}
