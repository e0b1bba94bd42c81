//! `headctl-perception` – turns raw sensor frames into control intent.
//!
//! # Modules
//!
//! - [`thermal`] – [`ThermalDetector`][thermal::ThermalDetector]: heat-source
//!   centroid, presence confidence, exponential smoothing, dead-zone
//!   filtering and the Idle/Tracking handoff state machine.

pub mod thermal;

pub use thermal::{DetectorConfig, DetectorOutput, ThermalDetector, TrackingState};
