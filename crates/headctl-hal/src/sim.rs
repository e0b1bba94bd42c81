//! In-process simulated endpoints for running without the physical head.
//!
//! A [`SimEndpoint`] records every command it is sent. Grab its [`SentLog`]
//! before moving the endpoint into a registry to inspect the traffic later.
//!
//! ```rust
//! use headctl_hal::sim::SimEndpoint;
//! use headctl_types::ActuatorTarget;
//!
//! let endpoint = SimEndpoint::new(ActuatorTarget::Mouth);
//! let log = endpoint.log();
//! assert!(log.is_empty());
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use headctl_types::{ActuatorCommand, ActuatorTarget, HeadError};
use parking_lot::Mutex;
use tracing::trace;

use crate::actuator::ActuatorEndpoint;

/// Shared handle onto the commands a [`SimEndpoint`] has received.
#[derive(Clone, Default)]
pub struct SentLog(Arc<Mutex<Vec<ActuatorCommand>>>);

impl SentLog {
    /// Drain and return everything recorded so far.
    pub fn take(&self) -> Vec<ActuatorCommand> {
        std::mem::take(&mut *self.0.lock())
    }

    pub fn snapshot(&self) -> Vec<ActuatorCommand> {
        self.0.lock().clone()
    }

    pub fn last(&self) -> Option<ActuatorCommand> {
        self.0.lock().last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Simulated actuator controller. Always succeeds.
pub struct SimEndpoint {
    target: ActuatorTarget,
    log: SentLog,
}

impl SimEndpoint {
    pub fn new(target: ActuatorTarget) -> Self {
        Self {
            target,
            log: SentLog::default(),
        }
    }

    pub fn log(&self) -> SentLog {
        self.log.clone()
    }
}

#[async_trait]
impl ActuatorEndpoint for SimEndpoint {
    fn target(&self) -> ActuatorTarget {
        self.target
    }

    async fn send(&self, command: &ActuatorCommand) -> Result<(), HeadError> {
        trace!(target_endpoint = %self.target, ?command, "sim endpoint received");
        self.log.0.lock().push(*command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_in_order() {
        let endpoint = SimEndpoint::new(ActuatorTarget::Gaze);
        let log = endpoint.log();
        endpoint.send(&ActuatorCommand::Claim).await.unwrap();
        endpoint
            .send(&ActuatorCommand::Gaze { x: 1, y: 2 })
            .await
            .unwrap();
        assert_eq!(log.last(), Some(ActuatorCommand::Gaze { x: 1, y: 2 }));
        assert_eq!(log.snapshot().len(), 2);
        assert_eq!(log.take().len(), 2);
        assert!(log.is_empty());
    }
}
