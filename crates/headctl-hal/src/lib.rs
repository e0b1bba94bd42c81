//! `headctl-hal` – Hardware Abstraction Layer for the animatronic head.
//!
//! Everything above this crate talks to the head through two seams:
//!
//! - [`ActuatorEndpoint`] – fire-and-forget delivery of an
//!   [`ActuatorCommand`][headctl_types::ActuatorCommand] to the gaze or mouth
//!   controller.
//! - [`ThermalSensor`] – on-demand capture of a
//!   [`ThermalFrame`][headctl_types::ThermalFrame].
//!
//! # Modules
//!
//! - [`codec`] – the shared single-opcode datagram format.
//! - [`actuator`] – endpoint trait and the UDP implementation.
//! - [`registry`] – routes commands to the endpoint for their target.
//! - [`sim`] – recording endpoints for headless runs and tests.
//! - [`sensor`] – thermal sensor trait and a simulated heat source.

pub mod actuator;
pub mod codec;
pub mod registry;
pub mod sensor;
pub mod sim;

pub use actuator::{ActuatorEndpoint, UdpEndpoint};
pub use registry::EndpointRegistry;
pub use sensor::{SimulatedThermalSensor, ThermalSensor};
pub use sim::{SentLog, SimEndpoint};
