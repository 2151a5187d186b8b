//! Calibration
//!
//! Zero-points the sensor on the first reading of a session. Every later
//! reading is reported as `reference - current`, i.e. the displacement from
//! where the source was held when streaming began.

use crate::domain::models::Orientation;

/// Per-session calibration. Build a new one for every session.
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    reference: Option<Orientation>,
}

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw reading and get the calibrated value back.
    ///
    /// The first call captures `raw` as the reference. The sign convention is
    /// reference minus current; receivers do not negate it.
    pub fn observe(&mut self, raw: Orientation) -> Orientation {
        let reference = *self.reference.get_or_insert_with(|| {
            tracing::info!("Calibration reference captured: {}", raw);
            raw
        });
        reference - raw
    }

    pub fn reference(&self) -> Option<Orientation> {
        self.reference
    }

    pub fn is_calibrated(&self) -> bool {
        self.reference.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_is_zero() {
        let mut calibration = Calibration::new();
        let x = Orientation::new(0.4, -1.2, 2.5);
        assert_eq!(calibration.observe(x), Orientation::ZERO);
        assert_eq!(calibration.observe(x), Orientation::ZERO);
        assert_eq!(calibration.reference(), Some(x));
    }

    #[test]
    fn test_delta_is_reference_minus_current() {
        let mut calibration = Calibration::new();
        let x = Orientation::new(1.0, 2.0, 3.0);
        let y = Orientation::new(1.5, 1.0, 3.25);
        calibration.observe(x);
        assert_eq!(calibration.observe(y), x - y);
        assert_eq!(calibration.observe(y), Orientation::new(-0.5, 1.0, -0.25));
    }

    #[test]
    fn test_reference_is_never_overwritten() {
        let mut calibration = Calibration::new();
        let first = Orientation::new(0.1, 0.2, 0.3);
        calibration.observe(first);
        calibration.observe(Orientation::new(9.0, 9.0, 9.0));
        calibration.observe(Orientation::new(-9.0, -9.0, -9.0));
        assert_eq!(calibration.reference(), Some(first));
    }

    #[test]
    fn test_fresh_instance_is_uncalibrated() {
        let calibration = Calibration::new();
        assert!(!calibration.is_calibrated());
        assert_eq!(calibration.reference(), None);
    }
}
