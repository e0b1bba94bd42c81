//! [`ThermalSensor`] trait and a simulated heat source.
//!
//! The physical driver (an 8×8 thermopile array on I²C) lives outside this
//! workspace; it only has to hand back [`ThermalFrame`]s through this trait.

use std::time::Instant;

use async_trait::async_trait;
use headctl_types::{HeadError, ThermalFrame};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Grid edge length of the thermopile array.
pub const GRID_SIZE: usize = 8;

/// A device producing thermal frames on demand.
#[async_trait]
pub trait ThermalSensor: Send {
    /// Stable identifier, used in logs.
    fn id(&self) -> &str;

    /// Capture one frame.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::SensorFault`] when the device cannot be read.
    async fn read_frame(&mut self) -> Result<ThermalFrame, HeadError>;
}

/// Simulated sensor with a warm body wandering across the field of view.
///
/// The body follows a slow Lissajous path and periodically leaves the scene
/// (`present_secs` in view, then `absent_secs` out of view) so that tracking
/// engages and releases on a bench without hardware.
pub struct SimulatedThermalSensor {
    id: String,
    started: Instant,
    rng: StdRng,
    ambient_c: f32,
    body_c: f32,
    present_secs: f32,
    absent_secs: f32,
}

impl SimulatedThermalSensor {
    pub fn new(seed: u64) -> Self {
        Self {
            id: "sim-thermal".to_string(),
            started: Instant::now(),
            rng: StdRng::seed_from_u64(seed),
            ambient_c: 21.0,
            body_c: 34.0,
            present_secs: 8.0,
            absent_secs: 4.0,
        }
    }

    /// Override the presence cycle.
    pub fn with_cycle(mut self, present_secs: f32, absent_secs: f32) -> Self {
        self.present_secs = present_secs;
        self.absent_secs = absent_secs;
        self
    }

    /// Render the frame the simulator would produce `t` seconds after start.
    pub fn frame_at(&mut self, t: f32) -> Result<ThermalFrame, HeadError> {
        let period = self.present_secs + self.absent_secs;
        let present = period <= 0.0 || t.rem_euclid(period) < self.present_secs;

        // Body centre in grid coordinates.
        let cx = 3.5 + 3.0 * (t * 0.7).sin();
        let cy = 3.5 + 2.0 * (t * 0.45).cos();
        let sigma2 = 2.0 * 1.2_f32.powi(2);

        let mut pixels = Vec::with_capacity(GRID_SIZE * GRID_SIZE);
        for row in 0..GRID_SIZE {
            for col in 0..GRID_SIZE {
                let noise: f32 = self.rng.gen_range(-0.25..0.25);
                let heat = if present {
                    let d2 = (col as f32 - cx).powi(2) + (row as f32 - cy).powi(2);
                    (self.body_c - self.ambient_c) * (-d2 / sigma2).exp()
                } else {
                    0.0
                };
                pixels.push(self.ambient_c + heat + noise);
            }
        }
        ThermalFrame::new(GRID_SIZE, GRID_SIZE, pixels)
    }
}

#[async_trait]
impl ThermalSensor for SimulatedThermalSensor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_frame(&mut self) -> Result<ThermalFrame, HeadError> {
        let t = self.started.elapsed().as_secs_f32();
        self.frame_at(t)
    }
}
