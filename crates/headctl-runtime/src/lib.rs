//! `headctl-runtime` – The control loop and everything that feeds it.
//!
//! # Modules
//!
//! - [`timeline`] – [`PlaybackSession`][timeline::PlaybackSession]: plays a
//!   bundle's channels against the wall clock.
//! - [`autonomous`] – [`IdleMotion`][autonomous::IdleMotion]: saccadic idle
//!   eye movement.
//! - [`audio`] – [`AudioSink`][audio::AudioSink]: start/stop cues for the
//!   external audio player.
//! - [`control_loop`] – [`ControlLoop`][control_loop::ControlLoop]: the
//!   fixed-period task that owns the arbiter and the active session.
//! - [`sensing`] – thermal sensor polling task.
//! - [`remote`] – live manual-control datagram ingress.
//! - [`daemon`] – [`Daemon`][daemon::Daemon]: broker-facing orchestration.
//! - [`telemetry`] – `tracing` / OpenTelemetry initialisation.

pub mod audio;
pub mod autonomous;
pub mod control_loop;
pub mod daemon;
pub mod remote;
pub mod sensing;
pub mod telemetry;
pub mod timeline;

pub use control_loop::{ControlLoop, ControlLoopConfig, LoopEvent, LoopIntent, SensorSample};
pub use daemon::{Daemon, DaemonExit, PowerControl, SystemPower};
pub use timeline::{PlaybackOptions, PlaybackSession};
