//! `headctl-kernel` – Control arbitration.
//!
//! Decides, tick by tick, which single source owns the head's actuators.
//!
//! # Modules
//!
//! - [`arbiter`] – [`ControlArbiter`][arbiter::ControlArbiter]: the
//!   priority state machine driven purely by explicit
//!   [`HandoffSignal`][headctl_types::HandoffSignal]s.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: per-source activity
//!   deadlines; a silent source is treated as having relinquished control.

pub mod arbiter;
pub mod watchdog;

pub use arbiter::{ControlArbiter, SwitchReason, Transition};
pub use watchdog::{SourceHealth, Watchdog};
