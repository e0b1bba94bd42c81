//! [`IdleMotion`] – the autonomous source.
//!
//! Produces saccadic idle eye movement: pick a random point inside the unit
//! circle, glide there over 75–175 ms with smoothstep easing
//! (`3t² − 2t³`), hold for 100–1100 ms, repeat.
//!
//! When disabled the generator emits nothing and the head holds its last
//! pose; a bundle that finishes with `resume_auto = false` leaves it that way
//! until the next explicit stop or a later bundle re-enables it.

use std::time::{Duration, Instant};

use headctl_types::{ControlVector, GazePosition};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

const MOVE_MS: (u64, u64) = (75, 175);
const HOLD_MS: (u64, u64) = (100, 1100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Moving,
    Holding,
}

pub struct IdleMotion {
    rng: StdRng,
    enabled: bool,
    phase: Phase,
    phase_start: Instant,
    phase_len: Duration,
    from: ControlVector,
    to: ControlVector,
    last_emitted: Option<GazePosition>,
}

impl IdleMotion {
    pub fn new(seed: u64, now: Instant) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let hold = Duration::from_millis(rng.gen_range(HOLD_MS.0..=HOLD_MS.1));
        Self {
            rng,
            enabled: true,
            phase: Phase::Holding,
            phase_start: now,
            phase_len: hold,
            from: ControlVector::default(),
            to: ControlVector::default(),
            last_emitted: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            debug!(enabled, "autonomous idle motion toggled");
        }
        self.enabled = enabled;
        if enabled {
            self.last_emitted = None;
        }
    }

    /// Forget the last emitted position so the next call re-emits it.
    pub fn resync(&mut self) {
        self.last_emitted = None;
    }

    /// Where the eyes should be at `now`, or `None` when disabled or when the
    /// position has not changed since the last emission.
    pub fn next(&mut self, now: Instant) -> Option<GazePosition> {
        if !self.enabled {
            return None;
        }
        self.advance_phases(now);

        let current = match self.phase {
            Phase::Holding => self.to,
            Phase::Moving => {
                let elapsed = now.saturating_duration_since(self.phase_start);
                let t = (elapsed.as_secs_f32() / self.phase_len.as_secs_f32()).clamp(0.0, 1.0);
                let e = t * t * (3.0 - 2.0 * t);
                ControlVector::new(
                    self.from.x + (self.to.x - self.from.x) * e,
                    self.from.y + (self.to.y - self.from.y) * e,
                )
            }
        };

        let gaze = current.to_gaze();
        if self.last_emitted == Some(gaze) {
            return None;
        }
        self.last_emitted = Some(gaze);
        Some(gaze)
    }

    fn advance_phases(&mut self, now: Instant) {
        while now.saturating_duration_since(self.phase_start) >= self.phase_len {
            self.phase_start += self.phase_len;
            match self.phase {
                Phase::Holding => {
                    self.from = self.to;
                    self.to = self.random_target();
                    self.phase = Phase::Moving;
                    self.phase_len = Duration::from_millis(self.rng.gen_range(MOVE_MS.0..=MOVE_MS.1));
                }
                Phase::Moving => {
                    self.phase = Phase::Holding;
                    self.phase_len = Duration::from_millis(self.rng.gen_range(HOLD_MS.0..=HOLD_MS.1));
                }
            }
        }
    }

    fn random_target(&mut self) -> ControlVector {
        let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
        let radius = self.rng.gen_range(0.0_f32..1.0).sqrt();
        ControlVector::new(radius * angle.cos(), radius * angle.sin())
    }
}
