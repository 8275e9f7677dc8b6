use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum samples kept per enrollment pose.
pub const MAX_SAMPLES_PER_POSE: usize = 10;
/// Samples per pose at which a pose counts as captured.
pub const TARGET_SAMPLES_PER_POSE: usize = 5;

/// Summary statistics of one depth frame, in meters.
///
/// All spreads are population standard deviations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameStatistics {
    pub mean: f32,
    pub std_dev: f32,
    pub range: f32,
    pub edge_std_dev: f32,
    pub center_std_dev: f32,
    pub gradient_mean: f32,
    pub gradient_std_dev: f32,
}

/// Per-user decision bounds derived from an enrollment capture.
///
/// Produced once by the calibrator and replaced wholesale on re-enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalizedThresholds {
    pub calculation_date: DateTime<Utc>,
    pub min_mean_depth: f32,
    pub max_mean_depth: f32,
    pub min_std_dev: f32,
    pub min_range: f32,
    pub min_edge_std_dev: f32,
    pub min_center_std_dev: f32,
    pub max_gradient_mean: f32,
    pub min_gradient_std_dev: f32,
}

impl PersonalizedThresholds {
    /// Whether every bound is a finite number.
    pub fn is_finite(&self) -> bool {
        [
            self.min_mean_depth,
            self.max_mean_depth,
            self.min_std_dev,
            self.min_range,
            self.min_edge_std_dev,
            self.min_center_std_dev,
            self.max_gradient_mean,
            self.min_gradient_std_dev,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// Prescribed head position used during enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pose {
    Center,
    Left,
    Right,
    Up,
    Down,
    Closer,
    Further,
}

impl Pose {
    pub const ALL: [Pose; 7] = [
        Pose::Center,
        Pose::Left,
        Pose::Right,
        Pose::Up,
        Pose::Down,
        Pose::Closer,
        Pose::Further,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Center => "center",
            Self::Left => "left",
            Self::Right => "right",
            Self::Up => "up",
            Self::Down => "down",
            Self::Closer => "closer",
            Self::Further => "further",
        }
    }
}

/// Frame statistics gathered per pose during enrollment.
///
/// Built incrementally by the enrollment flow and consumed once by the
/// calibrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollmentCaptureSet {
    samples: BTreeMap<Pose, Vec<FrameStatistics>>,
}

impl EnrollmentCaptureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample for `pose`. Returns `false` once the pose already
    /// holds [`MAX_SAMPLES_PER_POSE`] samples; the sample is dropped.
    pub fn push(&mut self, pose: Pose, stats: FrameStatistics) -> bool {
        let entries = self.samples.entry(pose).or_default();
        if entries.len() >= MAX_SAMPLES_PER_POSE {
            return false;
        }
        entries.push(stats);
        true
    }

    pub fn samples(&self, pose: Pose) -> &[FrameStatistics] {
        self.samples.get(&pose).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_pose_complete(&self, pose: Pose) -> bool {
        self.samples(pose).len() >= TARGET_SAMPLES_PER_POSE
    }

    /// Poses that have not yet reached [`TARGET_SAMPLES_PER_POSE`], in prompt order.
    pub fn missing_poses(&self) -> Vec<Pose> {
        Pose::ALL
            .into_iter()
            .filter(|p| !self.is_pose_complete(*p))
            .collect()
    }

    pub fn total_samples(&self) -> usize {
        self.samples.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(mean: f32) -> FrameStatistics {
        FrameStatistics {
            mean,
            std_dev: 0.03,
            range: 0.08,
            edge_std_dev: 0.03,
            center_std_dev: 0.01,
            gradient_mean: 0.01,
            gradient_std_dev: 0.005,
        }
    }

    #[test]
    fn test_push_caps_each_pose() {
        let mut set = EnrollmentCaptureSet::new();
        for i in 0..MAX_SAMPLES_PER_POSE {
            assert!(set.push(Pose::Center, stats(0.5 + i as f32 * 0.01)));
        }
        assert!(!set.push(Pose::Center, stats(0.9)));
        assert_eq!(set.samples(Pose::Center).len(), MAX_SAMPLES_PER_POSE);
        // Other poses are unaffected by the cap
        assert!(set.push(Pose::Left, stats(0.5)));
        assert_eq!(set.total_samples(), MAX_SAMPLES_PER_POSE + 1);
    }

    #[test]
    fn test_missing_poses_in_prompt_order() {
        let mut set = EnrollmentCaptureSet::new();
        for _ in 0..TARGET_SAMPLES_PER_POSE {
            set.push(Pose::Center, stats(0.5));
            set.push(Pose::Up, stats(0.5));
        }
        set.push(Pose::Left, stats(0.5));

        assert!(set.is_pose_complete(Pose::Center));
        assert!(!set.is_pose_complete(Pose::Left));
        assert_eq!(
            set.missing_poses(),
            vec![Pose::Left, Pose::Right, Pose::Down, Pose::Closer, Pose::Further]
        );
    }

    #[test]
    fn test_unknown_pose_has_no_samples() {
        let set = EnrollmentCaptureSet::new();
        assert!(set.samples(Pose::Further).is_empty());
        assert_eq!(set.missing_poses().len(), Pose::ALL.len());
    }

    #[test]
    fn test_thresholds_finite_check() {
        let mut t = PersonalizedThresholds {
            calculation_date: Utc::now(),
            min_mean_depth: 0.3,
            max_mean_depth: 0.7,
            min_std_dev: 0.01,
            min_range: 0.04,
            min_edge_std_dev: 0.01,
            min_center_std_dev: 0.004,
            max_gradient_mean: 0.05,
            min_gradient_std_dev: 0.001,
        };
        assert!(t.is_finite());
        t.max_gradient_mean = f32::INFINITY;
        assert!(!t.is_finite());
    }

    #[test]
    fn test_pose_serializes_lowercase() {
        let json = serde_json::to_string(&Pose::Closer).unwrap();
        assert_eq!(json, "\"closer\"");
        assert_eq!(Pose::Closer.as_str(), "closer");
    }
}
