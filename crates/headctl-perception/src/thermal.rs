//! Thermal heat-source detector.
//!
//! Converts each [`ThermalFrame`] into a smoothed [`ControlVector`] plus a
//! presence confidence, and decides when thermal tracking should hold the
//! actuators.
//!
//! # Pipeline
//!
//! 1. **Centroid** – every pixel contributes its temperature times its
//!    offset from the grid centre. The sums are divided by the pixel count
//!    and `sensitivity`, then clamped to `-1.0..=1.0` per axis. Columns are
//!    mirrored because the sensor faces the subject.
//! 2. **Confidence** – `peak − ambient_c`, clamped to `0..=confidence_max`.
//! 3. **Smoothing** – per axis:
//!    ```text
//!    smoothed = α · smoothed_prev + (1 − α) · raw
//!    ```
//!    The first frame after engaging seeds `smoothed` with `raw`.
//! 4. **Dead-zone** – a vector is only emitted when either axis moved by at
//!    least `min_change` since the last emitted vector.
//!
//! # State machine
//!
//! ```text
//!            confidence > detection_threshold
//!   Idle ───────────────────────────────────────▶ Tracking   (emits Active)
//!   Idle ◀─────────────────────────────────────── Tracking   (emits Inactive)
//!            confidence ≤ release_threshold
//!            or sensor lost
//! ```
//!
//! # Example
//!
//! ```rust
//! use headctl_perception::thermal::{DetectorConfig, ThermalDetector, TrackingState};
//! use headctl_types::{Handoff, ThermalFrame};
//!
//! let mut detector = ThermalDetector::new(DetectorConfig::default());
//!
//! let mut pixels = vec![21.0; 64];
//! pixels[27] = 35.0;
//! let frame = ThermalFrame::new(8, 8, pixels).unwrap();
//!
//! let out = detector.process(&frame);
//! assert_eq!(out.handoff.map(|h| h.handoff), Some(Handoff::Active));
//! assert_eq!(detector.state(), TrackingState::Tracking);
//! ```

use headctl_types::{ControlVector, HandoffSignal, HeadError, SourceKind, ThermalFrame};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Tuning knobs for [`ThermalDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Divisor applied to the weighted position sums; larger is less twitchy.
    pub sensitivity: f32,
    /// Baseline subtracted from the peak temperature (°C).
    pub ambient_c: f32,
    /// Upper clamp for confidence.
    pub confidence_max: f32,
    /// Idle → Tracking when confidence rises above this.
    pub detection_threshold: f32,
    /// Tracking → Idle when confidence falls to or below this.
    pub release_threshold: f32,
    /// Exponential smoothing factor α in `[0, 1)`.
    pub smoothing: f32,
    /// Dead-zone on either axis before a new vector is emitted.
    pub min_change: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sensitivity: 5.0,
            ambient_c: 20.0,
            confidence_max: 50.0,
            detection_threshold: 2.0,
            release_threshold: 1.5,
            smoothing: 0.7,
            min_change: 0.05,
        }
    }
}

impl DetectorConfig {
    /// Check the configuration for values that would break the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::FatalStartup`] describing the first offending
    /// field.
    pub fn validate(&self) -> Result<(), HeadError> {
        if self.release_threshold > self.detection_threshold {
            return Err(HeadError::FatalStartup(format!(
                "thermal release_threshold ({}) must not exceed detection_threshold ({})",
                self.release_threshold, self.detection_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(HeadError::FatalStartup(format!(
                "thermal smoothing must be in [0, 1), got {}",
                self.smoothing
            )));
        }
        if self.sensitivity <= 0.0 {
            return Err(HeadError::FatalStartup(
                "thermal sensitivity must be positive".to_string(),
            ));
        }
        if self.confidence_max <= 0.0 || self.min_change < 0.0 {
            return Err(HeadError::FatalStartup(
                "thermal confidence_max must be positive and min_change non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingState {
    Idle,
    Tracking,
}

/// Per-frame measurement before smoothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub raw: ControlVector,
    pub confidence: f32,
}

/// Result of feeding one frame to the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorOutput {
    /// Set on the frame that enters or leaves Tracking.
    pub handoff: Option<HandoffSignal>,
    /// Set when a new smoothed vector passed the dead-zone.
    pub vector: Option<ControlVector>,
    pub confidence: f32,
    /// State after processing the frame.
    pub state: TrackingState,
}

// ────────────────────────────────────────────────────────────────────────────
// ThermalDetector
// ────────────────────────────────────────────────────────────────────────────

pub struct ThermalDetector {
    config: DetectorConfig,
    state: TrackingState,
    smoothed: ControlVector,
    last_emitted: Option<ControlVector>,
}

impl ThermalDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            state: TrackingState::Idle,
            smoothed: ControlVector::default(),
            last_emitted: None,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn is_tracking(&self) -> bool {
        self.state == TrackingState::Tracking
    }

    pub fn smoothed(&self) -> ControlVector {
        self.smoothed
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Centroid and confidence for a single frame, with no state change.
    pub fn measure(&self, frame: &ThermalFrame) -> Measurement {
        let cx = (frame.width as f32 - 1.0) / 2.0;
        let cy = (frame.height as f32 - 1.0) / 2.0;
        let mut sum_x = 0.0_f32;
        let mut sum_y = 0.0_f32;
        for (i, &t) in frame.pixels.iter().enumerate() {
            let row = (i / frame.width) as f32;
            let col = (i % frame.width) as f32;
            sum_x += (cx - col) * t;
            sum_y += (row - cy) * t;
        }
        let scale = frame.pixels.len() as f32 * self.config.sensitivity;
        let raw = ControlVector::new(
            (sum_x / scale).clamp(-1.0, 1.0),
            (sum_y / scale).clamp(-1.0, 1.0),
        );
        let confidence =
            (frame.peak() - self.config.ambient_c).clamp(0.0, self.config.confidence_max);
        Measurement { raw, confidence }
    }

    /// Feed one frame through the pipeline.
    pub fn process(&mut self, frame: &ThermalFrame) -> DetectorOutput {
        let Measurement { raw, confidence } = self.measure(frame);
        let mut handoff = None;
        let mut vector = None;

        match self.state {
            TrackingState::Idle if confidence > self.config.detection_threshold => {
                info!(confidence, "heat source detected; thermal tracking engaged");
                self.state = TrackingState::Tracking;
                self.smoothed = raw;
                self.last_emitted = Some(raw);
                handoff = Some(HandoffSignal::active(SourceKind::Thermal));
                vector = Some(raw);
            }
            TrackingState::Idle => {}
            TrackingState::Tracking if confidence <= self.config.release_threshold => {
                info!(confidence, "heat source lost; thermal tracking released");
                self.reset();
                handoff = Some(HandoffSignal::inactive(SourceKind::Thermal));
            }
            TrackingState::Tracking => {
                let a = self.config.smoothing;
                self.smoothed = ControlVector::new(
                    a * self.smoothed.x + (1.0 - a) * raw.x,
                    a * self.smoothed.y + (1.0 - a) * raw.y,
                );
                if self.outside_dead_zone(self.smoothed) {
                    self.last_emitted = Some(self.smoothed);
                    vector = Some(self.smoothed);
                } else {
                    debug!(x = self.smoothed.x, y = self.smoothed.y, "thermal vector inside dead-zone");
                }
            }
        }

        DetectorOutput {
            handoff,
            vector,
            confidence,
            state: self.state,
        }
    }

    /// The sensor stopped producing frames. Leaves Tracking if engaged.
    pub fn sensor_lost(&mut self) -> Option<HandoffSignal> {
        if self.state == TrackingState::Tracking {
            info!("thermal sensor lost; thermal tracking released");
            self.reset();
            Some(HandoffSignal::inactive(SourceKind::Thermal))
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.state = TrackingState::Idle;
        self.last_emitted = None;
    }

    fn outside_dead_zone(&self, v: ControlVector) -> bool {
        match self.last_emitted {
            None => true,
            Some(last) => {
                (v.x - last.x).abs() >= self.config.min_change
                    || (v.y - last.y).abs() >= self.config.min_change
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
