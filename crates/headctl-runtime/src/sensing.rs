//! Thermal sensor polling task.
//!
//! Reads the sensor at a fixed rate and publishes the newest sample on a
//! `watch` channel, so a slow control tick only ever sees the latest frame.
//! A failed or timed-out read publishes [`SensorSample::Lost`] and polling
//! continues.

use std::time::Duration;

use headctl_hal::ThermalSensor;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::control_loop::SensorSample;

/// Poll `sensor` every `period` until the receiving side is dropped.
pub async fn poll_sensor<S: ThermalSensor>(
    mut sensor: S,
    period: Duration,
    read_timeout: Duration,
    tx: watch::Sender<Option<SensorSample>>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(sensor = sensor.id(), period_ms = period.as_millis() as u64, "thermal polling started");

    let mut healthy = true;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tx.closed() => break,
        }

        let sample = match tokio::time::timeout(read_timeout, sensor.read_frame()).await {
            Ok(Ok(frame)) => {
                if !healthy {
                    info!(sensor = sensor.id(), "thermal sensor recovered");
                    healthy = true;
                }
                SensorSample::Frame(frame)
            }
            Ok(Err(e)) => {
                if healthy {
                    warn!(sensor = sensor.id(), error = %e, "thermal read failed");
                    healthy = false;
                }
                SensorSample::Lost
            }
            Err(_) => {
                if healthy {
                    warn!(sensor = sensor.id(), timeout_ms = read_timeout.as_millis() as u64, "thermal read timed out");
                    healthy = false;
                }
                SensorSample::Lost
            }
        };

        if tx.send(Some(sample)).is_err() {
            break;
        }
    }
    info!(sensor = sensor.id(), "thermal polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use headctl_types::{HeadError, ThermalFrame};

    /// Fails every `fail_every`-th read.
    struct FlakySensor {
        reads: usize,
        fail_every: usize,
    }

    #[async_trait]
    impl ThermalSensor for FlakySensor {
        fn id(&self) -> &str {
            "flaky"
        }

        async fn read_frame(&mut self) -> Result<ThermalFrame, HeadError> {
            self.reads += 1;
            if self.reads % self.fail_every == 0 {
                return Err(HeadError::SensorFault("i2c nack".to_string()));
            }
            ThermalFrame::new(8, 8, vec![22.0; 64])
        }
    }

    struct StuckSensor;

    #[async_trait]
    impl ThermalSensor for StuckSensor {
        fn id(&self) -> &str {
            "stuck"
        }

        async fn read_frame(&mut self) -> Result<ThermalFrame, HeadError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn publishes_frames_and_losses() {
        let (tx, mut rx) = watch::channel(None);
        let sensor = FlakySensor {
            reads: 0,
            fail_every: 2,
        };
        let task = tokio::spawn(poll_sensor(
            sensor,
            Duration::from_millis(5),
            Duration::from_millis(50),
            tx,
        ));

        let mut frames = 0;
        let mut losses = 0;
        while frames == 0 || losses == 0 {
            rx.changed().await.unwrap();
            match rx.borrow_and_update().clone() {
                Some(SensorSample::Frame(_)) => frames += 1,
                Some(SensorSample::Lost) => losses += 1,
                None => {}
            }
        }
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn read_timeout_reports_lost() {
        let (tx, mut rx) = watch::channel(None);
        tokio::spawn(poll_sensor(
            StuckSensor,
            Duration::from_millis(5),
            Duration::from_millis(10),
            tx,
        ));
        rx.changed().await.unwrap();
        assert!(matches!(*rx.borrow(), Some(SensorSample::Lost)));
    }
}
