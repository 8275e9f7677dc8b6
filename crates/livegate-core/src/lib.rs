//! livegate-core — depth-based face liveness decisions.
//!
//! Turns 10×10 depth grids into frame statistics, evaluates them against
//! default or per-user bounds, calibrates those bounds from enrollment
//! captures, and runs the head-turn challenge used as a fallback.
//! No camera, storage or UI code lives here.

pub mod calibration;
pub mod challenge;
pub mod features;
pub mod liveness;
pub mod types;

pub use calibration::{CalibrationError, CalibrationParams, ThresholdCalibrator};
pub use challenge::{
    ChallengeDirection, ChallengeFailure, ChallengeOutcome, ChallengeParams, ChallengePhase,
    ChallengeReport, ChallengeSession, ChallengeStatus,
};
pub use features::{extract, Extraction, FrameSample};
pub use liveness::{
    evaluate_frame, CheckOutcome, FrameEvaluation, LivenessEngine, TemporalState,
    ThresholdBounds, ThresholdSource, Verdict,
};
pub use types::{EnrollmentCaptureSet, FrameStatistics, PersonalizedThresholds, Pose};
