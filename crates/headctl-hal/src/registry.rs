//! [`EndpointRegistry`] – routes commands to the endpoint for their target.

use std::collections::HashMap;

use headctl_types::{ActuatorCommand, ActuatorTarget, HeadError};

use crate::actuator::ActuatorEndpoint;

/// Central endpoint registry and [`ActuatorCommand`] dispatcher.
///
/// Construct with [`EndpointRegistry::new`], register one endpoint per
/// target, then call [`EndpointRegistry::dispatch`].
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: HashMap<ActuatorTarget, Box<dyn ActuatorEndpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint. Any previously registered endpoint for the same
    /// target is replaced.
    pub fn register(&mut self, endpoint: Box<dyn ActuatorEndpoint>) {
        self.endpoints.insert(endpoint.target(), endpoint);
    }

    pub fn with(mut self, endpoint: Box<dyn ActuatorEndpoint>) -> Self {
        self.register(endpoint);
        self
    }

    pub fn is_registered(&self, target: ActuatorTarget) -> bool {
        self.endpoints.contains_key(&target)
    }

    /// Send `command` to the endpoint registered for [`ActuatorCommand::target`].
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::Transport`] when no endpoint is registered for the
    /// target or the endpoint fails to send.
    pub async fn dispatch(&self, command: &ActuatorCommand) -> Result<(), HeadError> {
        let target = command.target();
        match self.endpoints.get(&target) {
            Some(endpoint) => endpoint.send(command).await,
            None => Err(HeadError::Transport {
                target,
                details: format!("no endpoint registered for {target}"),
            }),
        }
    }
}
