//! Keyframe channels.
//!
//! A [`Channel`] is a time-sorted list of `(t_ms, value)` keyframes. Sampling
//! between two keyframes interpolates linearly; sampling before the first or
//! after the last keyframe holds that endpoint's value. Discrete values such
//! as eyelid closure step instead of blending.

use headctl_types::{EyelidState, GazePosition};
use serde::{Deserialize, Serialize};

/// Values that can be linearly interpolated.
pub trait Lerp: Copy {
    /// Blend from `a` towards `b` by `f` in `0.0..=1.0`.
    fn lerp(a: Self, b: Self, f: f32) -> Self;
}

impl Lerp for u8 {
    fn lerp(a: Self, b: Self, f: f32) -> Self {
        let v = a as f32 + (b as f32 - a as f32) * f;
        v.round().clamp(0.0, 255.0) as u8
    }
}

impl Lerp for GazePosition {
    fn lerp(a: Self, b: Self, f: f32) -> Self {
        GazePosition {
            x: u8::lerp(a.x, b.x, f),
            y: u8::lerp(a.y, b.y, f),
        }
    }
}

/// Holds `a` until the next keyframe is reached.
impl Lerp for EyelidState {
    fn lerp(a: Self, b: Self, f: f32) -> Self {
        if f >= 1.0 { b } else { a }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyframe<T> {
    pub t_ms: u32,
    pub value: T,
}

impl<T> Keyframe<T> {
    pub fn new(t_ms: u32, value: T) -> Self {
        Self { t_ms, value }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Channel<T> {
    keyframes: Vec<Keyframe<T>>,
}

impl<T: Lerp> Channel<T> {
    /// Wrap keyframes, returning `None` if they are not sorted by time.
    pub fn new(keyframes: Vec<Keyframe<T>>) -> Option<Self> {
        if keyframes.windows(2).all(|w| w[0].t_ms <= w[1].t_ms) {
            Some(Self { keyframes })
        } else {
            None
        }
    }

    pub fn keyframes(&self) -> &[Keyframe<T>] {
        &self.keyframes
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    /// Timestamp of the final keyframe.
    pub fn end_ms(&self) -> Option<u32> {
        self.keyframes.last().map(|k| k.t_ms)
    }

    /// Value at `t_ms`. `None` only for an empty channel.
    pub fn sample(&self, t_ms: f64) -> Option<T> {
        let first = self.keyframes.first()?;
        let last = self.keyframes.last()?;
        if t_ms <= first.t_ms as f64 {
            return Some(first.value);
        }
        if t_ms >= last.t_ms as f64 {
            return Some(last.value);
        }
        // First keyframe strictly after t; guaranteed in 1..len by the checks above.
        let idx = self.keyframes.partition_point(|k| (k.t_ms as f64) <= t_ms);
        let (a, b) = (&self.keyframes[idx - 1], &self.keyframes[idx]);
        let span = (b.t_ms - a.t_ms) as f64;
        if span <= 0.0 {
            return Some(b.value);
        }
        let f = ((t_ms - a.t_ms as f64) / span) as f32;
        Some(T::lerp(a.value, b.value, f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaze_ramp() -> Channel<GazePosition> {
        Channel::new(vec![
            Keyframe::new(0, GazePosition::new(0, 0)),
            Keyframe::new(1000, GazePosition::new(255, 255)),
        ])
        .unwrap()
    }

    #[test]
    fn interpolates_midpoint() {
        assert_eq!(gaze_ramp().sample(500.0), Some(GazePosition::new(128, 128)));
        assert_eq!(gaze_ramp().sample(250.0), Some(GazePosition::new(64, 64)));
    }

    #[test]
    fn clamps_outside_range() {
        let ch = gaze_ramp();
        assert_eq!(ch.sample(-50.0), Some(GazePosition::new(0, 0)));
        assert_eq!(ch.sample(5000.0), Some(GazePosition::new(255, 255)));
    }

    #[test]
    fn hits_keyframes_exactly() {
        let ch = Channel::new(vec![
            Keyframe::new(100, 10u8),
            Keyframe::new(200, 50u8),
            Keyframe::new(300, 20u8),
        ])
        .unwrap();
        assert_eq!(ch.sample(200.0), Some(50));
        assert_eq!(ch.sample(250.0), Some(35));
        assert_eq!(ch.end_ms(), Some(300));
    }

    #[test]
    fn duplicate_timestamps_step() {
        let ch = Channel::new(vec![
            Keyframe::new(0, 0u8),
            Keyframe::new(100, 0u8),
            Keyframe::new(100, 200u8),
            Keyframe::new(200, 200u8),
        ])
        .unwrap();
        assert_eq!(ch.sample(99.0), Some(0));
        assert_eq!(ch.sample(150.0), Some(200));
    }

    #[test]
    fn eyelids_step_between_keyframes() {
        let closed = EyelidState::new(true, true);
        let ch = Channel::new(vec![
            Keyframe::new(0, EyelidState::OPEN),
            Keyframe::new(100, closed),
            Keyframe::new(180, EyelidState::OPEN),
        ])
        .unwrap();
        assert_eq!(ch.sample(99.0), Some(EyelidState::OPEN));
        assert_eq!(ch.sample(100.0), Some(closed));
        assert_eq!(ch.sample(179.0), Some(closed));
        assert_eq!(ch.sample(400.0), Some(EyelidState::OPEN));
    }

    #[test]
    fn rejects_unsorted_and_handles_empty() {
        assert!(Channel::new(vec![Keyframe::new(10, 1u8), Keyframe::new(5, 2u8)]).is_none());
        let empty: Channel<u8> = Channel::new(Vec::new()).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.sample(0.0), None);
    }
}
