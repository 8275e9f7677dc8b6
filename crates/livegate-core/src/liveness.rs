//! Passive liveness detection via depth statistics.
//!
//! A flat photograph or a screen held in front of a depth camera produces a
//! near-planar depth field: tiny spread, evenly spaced depth values, uniform
//! gradients. A live face has a pronounced 3D profile (nose, eye sockets,
//! cheeks) and moves involuntarily between frames. A rigid mask has the
//! profile but tends to move as one body, so the per-cell gradient changes
//! between frames are unnaturally uniform.
//!
//! Each frame runs nine checks. Realistic depth and center variation are
//! mandatory; at least four of the seven remaining checks must also pass for
//! a `Live` frame verdict.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, phone/tablet screen replays, flat
//!   cut-outs, rigid masks moved as a single body.
//! - **Does not block:** Flexible silicone masks worn by a live person.
//!   Texture-level spoof cues are outside this module.
//!
//! # Temporal state
//!
//! History lives in an explicit [`TemporalState`] value. [`evaluate_frame`]
//! takes it by mutable reference, so several sessions can run side by side
//! and tests can drive the evaluation directly. [`LivenessEngine`] wraps one
//! session's state and enforces that `reset()` starts each session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::features::{mean_std, Extraction, FrameSample};
use crate::types::{FrameStatistics, PersonalizedThresholds};

/// Default bounds used when no personalized thresholds exist.
pub const DEFAULT_MIN_MEAN_DEPTH: f32 = 0.2;
pub const DEFAULT_MAX_MEAN_DEPTH: f32 = 3.0;
pub const DEFAULT_MIN_STD_DEV: f32 = 0.02;
pub const DEFAULT_MIN_RANGE: f32 = 0.05;
pub const DEFAULT_MIN_EDGE_STD_DEV: f32 = 0.02;
pub const DEFAULT_MIN_CENTER_STD_DEV: f32 = 0.005;
pub const DEFAULT_MAX_GRADIENT_MEAN: f32 = 0.5;
pub const DEFAULT_MIN_GRADIENT_STD_DEV: f32 = 0.001;

/// Frame-to-frame mean depth change below this is suspiciously static (m).
const TEMPORAL_MIN_DELTA: f32 = 0.0005;
/// Frame-to-frame mean depth change above this is erratic (m).
const TEMPORAL_MAX_DELTA: f32 = 1.5;

/// Sorted depth steps whose std is under this fraction of their mean are
/// evenly spaced, as on a tilted plane.
const LINEAR_SPACING_RATIO: f32 = 0.3;

/// Gradient snapshots kept for micro-movement analysis.
pub const GRADIENT_HISTORY_CAPACITY: usize = 10;
const MICRO_MOVEMENT_MIN_ENTRIES: usize = 3;
const MICRO_MOVEMENT_MIN_SPAN: Duration = Duration::from_millis(500);
/// Per-pair movement variances whose std is under this fraction of their
/// mean indicate rigid, uniform movement.
const MICRO_MOVEMENT_UNIFORMITY_RATIO: f32 = 0.5;

/// Optional checks that must pass alongside both mandatory checks.
pub const REQUIRED_OPTIONAL_PASSES: usize = 4;
/// Number of optional checks.
pub const OPTIONAL_CHECKS: usize = 7;

const NEAR_ZERO: f32 = 1e-9;

/// Where the active bounds came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdSource {
    Default,
    Personalized,
}

/// Bounds consulted by the checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdBounds {
    pub min_mean_depth: f32,
    pub max_mean_depth: f32,
    pub min_std_dev: f32,
    pub min_range: f32,
    pub min_edge_std_dev: f32,
    pub min_center_std_dev: f32,
    pub max_gradient_mean: f32,
    pub min_gradient_std_dev: f32,
    pub source: ThresholdSource,
}

impl Default for ThresholdBounds {
    fn default() -> Self {
        Self {
            min_mean_depth: DEFAULT_MIN_MEAN_DEPTH,
            max_mean_depth: DEFAULT_MAX_MEAN_DEPTH,
            min_std_dev: DEFAULT_MIN_STD_DEV,
            min_range: DEFAULT_MIN_RANGE,
            min_edge_std_dev: DEFAULT_MIN_EDGE_STD_DEV,
            min_center_std_dev: DEFAULT_MIN_CENTER_STD_DEV,
            max_gradient_mean: DEFAULT_MAX_GRADIENT_MEAN,
            min_gradient_std_dev: DEFAULT_MIN_GRADIENT_STD_DEV,
            source: ThresholdSource::Default,
        }
    }
}

impl From<&PersonalizedThresholds> for ThresholdBounds {
    fn from(t: &PersonalizedThresholds) -> Self {
        Self {
            min_mean_depth: t.min_mean_depth,
            max_mean_depth: t.max_mean_depth,
            min_std_dev: t.min_std_dev,
            min_range: t.min_range,
            min_edge_std_dev: t.min_edge_std_dev,
            min_center_std_dev: t.min_center_std_dev,
            max_gradient_mean: t.max_gradient_mean,
            min_gradient_std_dev: t.min_gradient_std_dev,
            source: ThresholdSource::Personalized,
        }
    }
}

impl ThresholdBounds {
    /// Personalized bounds when present, defaults otherwise.
    pub fn resolve(thresholds: Option<&PersonalizedThresholds>) -> Self {
        thresholds.map(Self::from).unwrap_or_default()
    }
}

/// One stored gradient field with its capture instant.
#[derive(Debug, Clone)]
struct GradientSnapshot {
    captured_at: Instant,
    field: Vec<f32>,
}

/// History carried between frames of one verification session.
#[derive(Debug, Clone, Default)]
pub struct TemporalState {
    previous_mean: Option<f32>,
    gradient_history: VecDeque<GradientSnapshot>,
    last_sample_count: Option<usize>,
}

impl TemporalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous_mean(&self) -> Option<f32> {
        self.previous_mean
    }

    pub fn history_len(&self) -> usize {
        self.gradient_history.len()
    }

    /// Valid sample count of the most recent frame, including insufficient ones.
    pub fn last_sample_count(&self) -> Option<usize> {
        self.last_sample_count
    }

    fn record(&mut self, sample: &FrameSample, captured_at: Instant) {
        self.previous_mean = Some(sample.statistics().mean);
        if self.gradient_history.len() == GRADIENT_HISTORY_CAPACITY {
            self.gradient_history.pop_front();
        }
        self.gradient_history.push_back(GradientSnapshot {
            captured_at,
            field: sample.gradient_field().to_vec(),
        });
        self.last_sample_count = Some(sample.values().len());
    }
}

/// Results of the nine checks for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub realistic_depth: bool,
    pub center_variation: bool,
    pub edge_variation: bool,
    pub depth_profile: bool,
    pub depth_variation: bool,
    pub non_linear_distribution: bool,
    pub gradient_pattern: bool,
    pub temporal_consistency: bool,
    pub natural_micro_movements: bool,
    pub statistics: FrameStatistics,
}

impl CheckOutcome {
    pub fn mandatory_passed(&self) -> bool {
        self.realistic_depth && self.center_variation
    }

    pub fn optional_results(&self) -> [bool; OPTIONAL_CHECKS] {
        [
            self.edge_variation,
            self.depth_profile,
            self.depth_variation,
            self.non_linear_distribution,
            self.gradient_pattern,
            self.temporal_consistency,
            self.natural_micro_movements,
        ]
    }

    pub fn optional_passed(&self) -> usize {
        self.optional_results().iter().filter(|p| **p).count()
    }

    /// Passing checks out of all nine.
    pub fn checks_passed(&self) -> usize {
        self.optional_passed()
            + usize::from(self.realistic_depth)
            + usize::from(self.center_variation)
    }

    pub fn is_live(&self) -> bool {
        self.mandatory_passed() && self.optional_passed() >= REQUIRED_OPTIONAL_PASSES
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Live,
    NotLive,
    InsufficientData,
}

/// Per-frame report for display and logging.
#[derive(Debug, Clone, Serialize)]
pub struct FrameEvaluation {
    pub verdict: Verdict,
    pub checks_passed: usize,
    pub optional_checks_passed: usize,
    pub valid_samples: usize,
    pub threshold_source: ThresholdSource,
    pub statistics: Option<FrameStatistics>,
    pub checks: Option<CheckOutcome>,
}

impl FrameEvaluation {
    pub fn is_live(&self) -> bool {
        self.verdict == Verdict::Live
    }
}

/// Run the nine checks for `sample` against `state` without touching it.
pub fn run_checks(
    sample: &FrameSample,
    bounds: &ThresholdBounds,
    state: &TemporalState,
) -> CheckOutcome {
    let stats = sample.statistics();
    let basic = statistical_checks(stats, bounds);
    CheckOutcome {
        realistic_depth: basic.realistic_depth,
        center_variation: basic.center_variation,
        edge_variation: basic.edge_variation,
        depth_profile: basic.depth_profile,
        depth_variation: basic.depth_variation,
        non_linear_distribution: is_non_linear(sample.values()),
        gradient_pattern: basic.gradient_pattern,
        temporal_consistency: temporal_consistency(state.previous_mean, stats.mean),
        natural_micro_movements: natural_micro_movements(&state.gradient_history),
        statistics: *stats,
    }
}

/// Evaluate one extracted frame and fold it into `state`.
///
/// History is updated with every sufficient frame regardless of verdict.
/// Insufficient frames only update the sample-count record.
pub fn evaluate_frame(
    extraction: &Extraction,
    bounds: &ThresholdBounds,
    state: &mut TemporalState,
    captured_at: Instant,
) -> FrameEvaluation {
    let sample = match extraction {
        Extraction::Sample(sample) => sample,
        Extraction::Insufficient { valid } => {
            state.last_sample_count = Some(*valid);
            tracing::debug!(valid, "frame has insufficient depth data");
            return FrameEvaluation {
                verdict: Verdict::InsufficientData,
                checks_passed: 0,
                optional_checks_passed: 0,
                valid_samples: *valid,
                threshold_source: bounds.source,
                statistics: None,
                checks: None,
            };
        }
    };

    let outcome = run_checks(sample, bounds, state);
    state.record(sample, captured_at);

    let verdict = if outcome.is_live() {
        Verdict::Live
    } else {
        Verdict::NotLive
    };

    tracing::debug!(
        ?verdict,
        mean = outcome.statistics.mean,
        std_dev = outcome.statistics.std_dev,
        center_std_dev = outcome.statistics.center_std_dev,
        mandatory = outcome.mandatory_passed(),
        optional = outcome.optional_passed(),
        "frame evaluated"
    );

    FrameEvaluation {
        verdict,
        checks_passed: outcome.checks_passed(),
        optional_checks_passed: outcome.optional_passed(),
        valid_samples: sample.values().len(),
        threshold_source: bounds.source,
        statistics: Some(outcome.statistics),
        checks: Some(outcome),
    }
}

/// Stateful wrapper owning one session's [`TemporalState`].
///
/// A fresh engine is idle; `reset()` starts a session and must be called
/// before the first frame of every session.
#[derive(Debug, Clone)]
pub struct LivenessEngine {
    bounds: ThresholdBounds,
    state: Option<TemporalState>,
}

impl LivenessEngine {
    pub fn new(thresholds: Option<&PersonalizedThresholds>) -> Self {
        Self {
            bounds: ThresholdBounds::resolve(thresholds),
            state: None,
        }
    }

    pub fn bounds(&self) -> &ThresholdBounds {
        &self.bounds
    }

    /// Swap the active bounds, e.g. after a new enrollment.
    pub fn set_thresholds(&mut self, thresholds: Option<&PersonalizedThresholds>) {
        self.bounds = ThresholdBounds::resolve(thresholds);
    }

    /// Start a new session, discarding all history.
    pub fn reset(&mut self) {
        self.state = Some(TemporalState::new());
    }

    pub fn state(&self) -> Option<&TemporalState> {
        self.state.as_ref()
    }

    /// Evaluate the next frame of the current session.
    ///
    /// # Panics
    ///
    /// Panics if no session was started with [`LivenessEngine::reset`].
    pub fn evaluate(&mut self, extraction: &Extraction, captured_at: Instant) -> FrameEvaluation {
        let state = self
            .state
            .as_mut()
            .expect("LivenessEngine::evaluate called before reset() started a session");
        evaluate_frame(extraction, &self.bounds, state, captured_at)
    }
}

/// Checks that depend only on the frame statistics.
#[derive(Debug, Clone, Copy)]
struct StatisticalChecks {
    realistic_depth: bool,
    center_variation: bool,
    edge_variation: bool,
    depth_profile: bool,
    depth_variation: bool,
    gradient_pattern: bool,
}

fn statistical_checks(stats: &FrameStatistics, b: &ThresholdBounds) -> StatisticalChecks {
    let spread = stats.std_dev >= b.min_std_dev;
    let range = stats.range >= b.min_range;
    StatisticalChecks {
        realistic_depth: stats.mean >= b.min_mean_depth && stats.mean <= b.max_mean_depth,
        center_variation: stats.center_std_dev >= b.min_center_std_dev,
        edge_variation: stats.edge_std_dev >= b.min_edge_std_dev,
        depth_profile: spread || range,
        depth_variation: spread && range,
        gradient_pattern: stats.gradient_std_dev >= b.min_gradient_std_dev
            && stats.gradient_mean <= b.max_gradient_mean,
    }
}

/// Evenly spaced sorted depths (or no spacing at all) indicate a plane.
fn is_non_linear(values: &[f32]) -> bool {
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let steps: Vec<f32> = sorted.windows(2).map(|w| w[1] - w[0]).collect();
    if steps.is_empty() {
        return false;
    }
    let (mean, std) = mean_std(&steps);
    if mean <= NEAR_ZERO {
        return false;
    }
    std >= LINEAR_SPACING_RATIO * mean
}

fn temporal_consistency(previous_mean: Option<f32>, mean: f32) -> bool {
    // No previous frame: treated as inconsistent.
    let Some(previous) = previous_mean else {
        return false;
    };
    let delta = (mean - previous).abs();
    (TEMPORAL_MIN_DELTA..=TEMPORAL_MAX_DELTA).contains(&delta)
}

fn natural_micro_movements(history: &VecDeque<GradientSnapshot>) -> bool {
    let (Some(oldest), Some(newest)) = (history.front(), history.back()) else {
        return true;
    };
    if history.len() < MICRO_MOVEMENT_MIN_ENTRIES
        || newest.captured_at.saturating_duration_since(oldest.captured_at)
            < MICRO_MOVEMENT_MIN_SPAN
    {
        // Not enough history to judge.
        return true;
    }

    let pair_variances: Vec<f32> = history
        .iter()
        .zip(history.iter().skip(1))
        .map(|(prev, next)| {
            let diffs: Vec<f32> = prev
                .field
                .iter()
                .zip(&next.field)
                .filter(|(a, b)| a.is_finite() && b.is_finite())
                .map(|(a, b)| (a - b).abs())
                .collect();
            let (_, std) = mean_std(&diffs);
            std * std
        })
        .collect();

    let (mean, std) = mean_std(&pair_variances);
    if mean <= NEAR_ZERO {
        return false;
    }
    std >= MICRO_MOVEMENT_UNIFORMITY_RATIO * mean
}
