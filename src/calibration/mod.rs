//! Two-window whammy calibration.
//!
//! The rest window fixes the lower bound, the full-travel window the upper
//! bound. Both are padded so the calibrated range strictly contains every
//! reading seen.
pub mod calibrator;

pub use calibrator::AutoCalibrator;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{ConfigError, DeviceConfig};

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
pub const PHASE_WINDOW: Duration = Duration::from_secs(3);
pub const AXIS_MAX: i64 = 65535;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationPhase {
    Idle,
    SamplingRest,
    SamplingFull,
    Complete,
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProgress {
    pub phase: CalibrationPhase,
    pub samples: usize,
    pub elapsed_ms: u64,
    pub window_ms: u64,
    pub latest: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub min: i32,
    pub max: i32,
    pub mean: f64,
    pub count: usize,
}

impl SampleStats {
    pub fn from_samples(samples: &[i32]) -> Option<Self> {
        let min = *samples.iter().min()?;
        let max = *samples.iter().max()?;
        let sum: i64 = samples.iter().map(|s| *s as i64).sum();
        Some(Self { min, max, mean: sum as f64 / samples.len() as f64, count: samples.len() })
    }

    /// `max(100, floor(0.1 * (max - min) + 200))`
    pub fn padding(&self) -> i64 {
        let spread = (self.max as i64 - self.min as i64).max(0);
        (spread / 10 + 200).max(100)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub min: u16,
    pub max: u16,
    pub rest: SampleStats,
    pub full: SampleStats,
}

impl CalibrationResult {
    pub fn from_stats(rest: SampleStats, full: SampleStats) -> Self {
        Self { min: lower_bound(&rest), max: upper_bound(&full), rest, full }
    }

    /// Calibrated bounds replace any manually entered ones.
    pub fn apply_to(&self, config: &mut DeviceConfig) -> Result<(), ConfigError> {
        config.set_whammy_bounds(self.min, self.max)
    }
}

pub fn lower_bound(rest: &SampleStats) -> u16 {
    (rest.min as i64 - rest.padding()).clamp(0, AXIS_MAX) as u16
}

pub fn upper_bound(full: &SampleStats) -> u16 {
    (full.max as i64 + full.padding()).clamp(0, AXIS_MAX) as u16
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("no whammy readings during {phase:?}; check the whammy is connected")]
    NoSamples { phase: CalibrationPhase },

    #[error("device disconnected during calibration")]
    DeviceLost,

    #[error("calibration cancelled")]
    Cancelled,

    #[error("a calibration is already running")]
    Busy,

    #[error("could not poll the whammy: {0}")]
    Poller(String),
}

impl CalibrationError {
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_from_documented_samples() {
        let rest = SampleStats::from_samples(&[100, 120, 110]).unwrap();
        let full = SampleStats::from_samples(&[60000, 60500, 60200]).unwrap();
        assert_eq!(rest.padding(), 202);
        assert_eq!(full.padding(), 250);
        let result = CalibrationResult::from_stats(rest, full);
        assert_eq!((result.min, result.max), (0, 60750));
        assert!((rest.mean - 110.0).abs() < f64::EPSILON);
    }

    #[test]
    fn upper_bound_saturates() {
        let full = SampleStats::from_samples(&[65000, 65535]).unwrap();
        assert_eq!(upper_bound(&full), 65535);
        let rest = SampleStats::from_samples(&[5000, 5000]).unwrap();
        assert_eq!(rest.padding(), 200);
        assert_eq!(lower_bound(&rest), 4800);
    }

    #[test]
    fn empty_window_has_no_stats() {
        assert!(SampleStats::from_samples(&[]).is_none());
    }
}
