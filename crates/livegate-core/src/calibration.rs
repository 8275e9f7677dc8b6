//! Per-user threshold calibration from an enrollment capture.
//!
//! Only the Center pose feeds the bounds. Off-axis poses shift the mean
//! depth and stretch the edge spread in ways that would widen the bounds
//! past usefulness; they are captured for completeness and left untouched.
//!
//! For every tracked statistic the calibrator takes the mean `μ` and the
//! population standard deviation `σ` across Center samples and derives
//! `μ - k·σ` for lower bounds and `μ + k·σ` for upper bounds. Lower bounds
//! on spreads are floored at zero.
//!
//! The calibrator never falls back to defaults itself. On failure the caller
//! keeps using the engine's default bounds.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::features::mean_std;
use crate::types::{EnrollmentCaptureSet, FrameStatistics, PersonalizedThresholds, Pose};

/// Default bound multiplier.
pub const DEFAULT_K: f32 = 2.0;
/// Default minimum number of Center-pose samples.
pub const DEFAULT_MIN_CENTER_SAMPLES: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("not enough center-pose samples: {found} (need {required})")]
    InsufficientSamples { found: usize, required: usize },
    #[error("derived bound {0} is not finite")]
    NonFiniteBound(&'static str),
    #[error("invalid bound multiplier: {0}")]
    InvalidMultiplier(f32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationParams {
    /// Number of standard deviations between the enrollment mean and a bound.
    pub k: f32,
    pub min_center_samples: usize,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            min_center_samples: DEFAULT_MIN_CENTER_SAMPLES,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThresholdCalibrator {
    params: CalibrationParams,
}

impl ThresholdCalibrator {
    pub fn new(params: CalibrationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &CalibrationParams {
        &self.params
    }

    /// Calibrate and stamp the result with the current time.
    pub fn calibrate(
        &self,
        capture: &EnrollmentCaptureSet,
    ) -> Result<PersonalizedThresholds, CalibrationError> {
        self.calibrate_at(capture, Utc::now())
    }

    /// Calibrate with an explicit calculation date. Identical inputs give
    /// identical bounds.
    pub fn calibrate_at(
        &self,
        capture: &EnrollmentCaptureSet,
        calculation_date: DateTime<Utc>,
    ) -> Result<PersonalizedThresholds, CalibrationError> {
        let k = self.params.k;
        if !k.is_finite() || k < 0.0 {
            return Err(CalibrationError::InvalidMultiplier(k));
        }

        let center = capture.samples(Pose::Center);
        // Bounds need at least one sample whatever the configured minimum.
        let required = self.params.min_center_samples.max(1);
        if center.len() < required {
            tracing::warn!(
                found = center.len(),
                required,
                "calibration: too few center-pose samples"
            );
            return Err(CalibrationError::InsufficientSamples {
                found: center.len(),
                required,
            });
        }

        let spread = |field: fn(&FrameStatistics) -> f32| -> (f32, f32) {
            let values: Vec<f32> = center.iter().map(field).collect();
            mean_std(&values)
        };
        let lower = |name: &'static str, (mu, sigma): (f32, f32)| -> Result<f32, CalibrationError> {
            finite(name, mu - k * sigma)
        };
        let upper = |name: &'static str, (mu, sigma): (f32, f32)| -> Result<f32, CalibrationError> {
            finite(name, mu + k * sigma)
        };

        let mean = spread(|s| s.mean);
        let thresholds = PersonalizedThresholds {
            calculation_date,
            min_mean_depth: lower("min_mean_depth", mean)?,
            max_mean_depth: upper("max_mean_depth", mean)?,
            min_std_dev: lower("min_std_dev", spread(|s| s.std_dev))?.max(0.0),
            min_range: lower("min_range", spread(|s| s.range))?.max(0.0),
            min_edge_std_dev: lower("min_edge_std_dev", spread(|s| s.edge_std_dev))?.max(0.0),
            min_center_std_dev: lower("min_center_std_dev", spread(|s| s.center_std_dev))?
                .max(0.0),
            max_gradient_mean: upper("max_gradient_mean", spread(|s| s.gradient_mean))?,
            min_gradient_std_dev: lower("min_gradient_std_dev", spread(|s| s.gradient_std_dev))?
                .max(0.0),
        };

        tracing::info!(
            samples = center.len(),
            k,
            min_mean_depth = thresholds.min_mean_depth,
            max_mean_depth = thresholds.max_mean_depth,
            "calibration: personalized thresholds derived"
        );

        Ok(thresholds)
    }
}

fn finite(name: &'static str, value: f32) -> Result<f32, CalibrationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        tracing::warn!(bound = name, "calibration: non-finite bound");
        Err(CalibrationError::NonFiniteBound(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(mean: f32, std_dev: f32) -> FrameStatistics {
        FrameStatistics {
            mean,
            std_dev,
            range: std_dev * 3.0,
            edge_std_dev: 0.03,
            center_std_dev: 0.012,
            gradient_mean: 0.02,
            gradient_std_dev: 0.008,
        }
    }

    fn center_capture(means: &[f32]) -> EnrollmentCaptureSet {
        let mut set = EnrollmentCaptureSet::new();
        for &m in means {
            set.push(Pose::Center, sample(m, 0.04));
        }
        set
    }

    #[test]
    fn test_bounds_follow_mean_and_sigma() {
        // Means 0.4 and 0.6 alternate: mu = 0.5, population sigma = 0.1
        let capture = center_capture(&[0.4, 0.6, 0.4, 0.6, 0.4, 0.6]);
        let t = ThresholdCalibrator::default().calibrate(&capture).unwrap();
        assert!((t.min_mean_depth - 0.3).abs() < 1e-5);
        assert!((t.max_mean_depth - 0.7).abs() < 1e-5);
        // Identical spreads: sigma = 0, bound equals the enrollment value
        assert!((t.min_std_dev - 0.04).abs() < 1e-6);
        assert!((t.min_center_std_dev - 0.012).abs() < 1e-6);
        assert!((t.max_gradient_mean - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_custom_multiplier() {
        let capture = center_capture(&[0.4, 0.6, 0.4, 0.6, 0.4, 0.6]);
        let calibrator = ThresholdCalibrator::new(CalibrationParams {
            k: 1.5,
            ..CalibrationParams::default()
        });
        let t = calibrator.calibrate(&capture).unwrap();
        assert!((t.min_mean_depth - 0.35).abs() < 1e-5);
        assert!((t.max_mean_depth - 0.65).abs() < 1e-5);
    }

    #[test]
    fn test_only_center_pose_used() {
        let mut capture = center_capture(&[0.5; 5]);
        for _ in 0..5 {
            capture.push(Pose::Closer, sample(0.25, 0.2));
            capture.push(Pose::Further, sample(1.2, 0.01));
        }
        let t = ThresholdCalibrator::default().calibrate(&capture).unwrap();
        assert!((t.min_mean_depth - 0.5).abs() < 1e-6);
        assert!((t.max_mean_depth - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_too_few_center_samples() {
        let mut capture = center_capture(&[0.5; 4]);
        for _ in 0..10 {
            capture.push(Pose::Left, sample(0.5, 0.04));
        }
        let err = ThresholdCalibrator::default().calibrate(&capture).unwrap_err();
        assert_eq!(
            err,
            CalibrationError::InsufficientSamples {
                found: 4,
                required: 5
            }
        );
    }

    #[test]
    fn test_zero_minimum_still_needs_one_sample() {
        let calibrator = ThresholdCalibrator::new(CalibrationParams {
            min_center_samples: 0,
            ..CalibrationParams::default()
        });
        let err = calibrator.calibrate(&EnrollmentCaptureSet::new()).unwrap_err();
        assert_eq!(
            err,
            CalibrationError::InsufficientSamples {
                found: 0,
                required: 1
            }
        );
        assert_eq!(err.to_string(), "not enough center-pose samples: 0 (need 1)");
    }

    #[test]
    fn test_non_finite_bound_rejected() {
        let mut capture = center_capture(&[0.5; 4]);
        capture.push(Pose::Center, sample(f32::INFINITY, 0.04));
        let err = ThresholdCalibrator::default().calibrate(&capture).unwrap_err();
        assert!(matches!(err, CalibrationError::NonFiniteBound("min_mean_depth")));
    }

    #[test]
    fn test_invalid_multiplier_rejected() {
        let calibrator = ThresholdCalibrator::new(CalibrationParams {
            k: f32::NAN,
            ..CalibrationParams::default()
        });
        let err = calibrator.calibrate(&center_capture(&[0.5; 5])).unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidMultiplier(_)));
    }

    #[test]
    fn test_lower_bounds_floored_at_zero() {
        let mut capture = EnrollmentCaptureSet::new();
        for std_dev in [0.001, 0.1, 0.001, 0.1, 0.001] {
            capture.push(Pose::Center, sample(0.5, std_dev));
        }
        let t = ThresholdCalibrator::default().calibrate(&capture).unwrap();
        assert_eq!(t.min_std_dev, 0.0);
        assert_eq!(t.min_range, 0.0);
    }

    #[test]
    fn test_calibration_is_deterministic() {
        let capture = center_capture(&[0.48, 0.52, 0.5, 0.51, 0.49, 0.5, 0.47]);
        let calibrator = ThresholdCalibrator::default();
        let a = calibrator.calibrate(&capture).unwrap();
        let b = calibrator.calibrate(&capture).unwrap();

        let bits = |t: &PersonalizedThresholds| {
            [
                t.min_mean_depth,
                t.max_mean_depth,
                t.min_std_dev,
                t.min_range,
                t.min_edge_std_dev,
                t.min_center_std_dev,
                t.max_gradient_mean,
                t.min_gradient_std_dev,
            ]
            .map(f32::to_bits)
        };
        assert_eq!(bits(&a), bits(&b));

        let date = Utc::now();
        assert_eq!(
            calibrator.calibrate_at(&capture, date).unwrap(),
            calibrator.calibrate_at(&capture, date).unwrap()
        );
    }
}
