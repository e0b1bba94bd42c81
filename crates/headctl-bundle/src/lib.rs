//! `headctl-bundle` – Animation bundles.
//!
//! A bundle is a pre-authored performance: gaze keyframes, mouth keyframes
//! and an audio segment reference, all sharing one timeline.
//!
//! # Modules
//!
//! - [`channel`] – sorted keyframe channels with clamped linear
//!   interpolation.
//! - [`format`] – the `HBDL` binary container: decode, validate, encode.
//! - [`store`] – path-contained loading from the bundle directory, with a
//!   cache that forgets a bundle once no session holds it.

pub mod channel;
pub mod format;
pub mod store;

pub use channel::{Channel, Keyframe, Lerp};
pub use format::{AnimationBundle, AudioEncoding, AudioSegment};
pub use store::BundleStore;
