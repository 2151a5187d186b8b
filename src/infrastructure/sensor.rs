//! Sensor Source
//!
//! Supplies raw orientation readings to the source driver.

use std::f32::consts::TAU;

use crate::domain::models::Orientation;

/// Something that can be sampled for the device's current attitude.
pub trait SensorSource: Send {
    /// Latest raw reading, if the sensor has one.
    fn read(&mut self) -> Option<Orientation>;
}

/// Synthetic attitude for running without motion hardware.
///
/// Each axis sweeps a sine wave with its own phase, advancing one step per
/// read, so consecutive readings differ and the display visibly moves.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    step: u64,
    amplitude: f32,
    period_steps: u64,
}

impl SimulatedSensor {
    pub fn new(amplitude: f32, period_steps: u64) -> Self {
        Self {
            step: 0,
            amplitude,
            period_steps: period_steps.max(1),
        }
    }

    fn phase(&self) -> f32 {
        (self.step % self.period_steps) as f32 / self.period_steps as f32 * TAU
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        // Half a radian either way, one full sweep every 4 s at 60 Hz.
        Self::new(0.5, 240)
    }
}

impl SensorSource for SimulatedSensor {
    fn read(&mut self) -> Option<Orientation> {
        let phase = self.phase();
        self.step = self.step.wrapping_add(1);
        Some(Orientation::new(
            self.amplitude * phase.sin(),
            self.amplitude * (phase + TAU / 3.0).sin(),
            self.amplitude * (phase + 2.0 * TAU / 3.0).sin(),
        ))
    }
}

/// Replays fixed readings, then keeps repeating the last one.
#[derive(Debug, Clone, Default)]
pub struct ReplaySensor {
    readings: Vec<Orientation>,
    next: usize,
}

impl ReplaySensor {
    pub fn new(readings: Vec<Orientation>) -> Self {
        Self { readings, next: 0 }
    }
}

impl SensorSource for ReplaySensor {
    fn read(&mut self) -> Option<Orientation> {
        let reading = self
            .readings
            .get(self.next)
            .or_else(|| self.readings.last())
            .copied();
        self.next = (self.next + 1).min(self.readings.len());
        reading
    }
}
