//! Head-turn challenge used when passive depth liveness is inconclusive.
//!
//! The user is asked to turn their head to one side and back. The session
//! tracks head yaw through three milestones:
//!
//! - **P1**: head centered (yaw within the P1 threshold on the requested side)
//!   and starting to move toward the requested side.
//! - **P2**: head turned past the P2 threshold in the requested direction.
//! - **P3**: head back inside the P1 threshold.
//!
//! Yaw samples between P1 and P2 (outward leg) and between P2 and P3 (return
//! leg) are recorded. On reaching P3 the two legs must differ, each must
//! trend the right way, and their velocity profiles must differ. A replayed
//! or synthesized turn tends to fail one of these.
//!
//! Yaw is in degrees, positive when the head turns to the user's left. A
//! turn in the wrong direction never reaches P2, so the session runs into
//! its timeout rather than failing early.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub const DEFAULT_P1_THRESHOLD_DEG: f32 = 5.0;
pub const DEFAULT_P2_THRESHOLD_DEG: f32 = 25.0;
pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(10);
/// Mean per-sample speeds of the two legs closer than this are "identical".
pub const DEFAULT_MIN_DYNAMICS_DIFFERENCE_DEG: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeDirection {
    TurnLeft,
    TurnRight,
}

impl ChallengeDirection {
    /// Pick a direction at random so a prerecorded turn is right only half the time.
    pub fn random() -> Self {
        if rand::random::<bool>() {
            Self::TurnLeft
        } else {
            Self::TurnRight
        }
    }

    /// User-facing instruction.
    pub fn prompt(&self) -> &'static str {
        match self {
            Self::TurnLeft => "Slowly turn your head to the left, then back to center",
            Self::TurnRight => "Slowly turn your head to the right, then back to center",
        }
    }

    /// Multiplier that maps yaw onto "positive = requested direction".
    fn sign(&self) -> f32 {
        match self {
            Self::TurnLeft => 1.0,
            Self::TurnRight => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengePhase {
    Idle,
    AwaitingP1,
    AwaitingP2,
    AwaitingP3,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeFailure {
    Timeout,
    FaceLost,
    /// Both legs hold the same yaw values.
    StaticMotion,
    /// A leg does not move the way its phase requires.
    WrongTrend,
    /// Both legs move at the same average speed.
    UniformDynamics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "reason")]
pub enum ChallengeOutcome {
    Pass,
    Fail(ChallengeFailure),
}

/// Externally visible status after each update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    InProgress,
    Pass,
    Fail,
    Timeout,
}

impl From<ChallengeOutcome> for ChallengeStatus {
    fn from(outcome: ChallengeOutcome) -> Self {
        match outcome {
            ChallengeOutcome::Pass => Self::Pass,
            ChallengeOutcome::Fail(ChallengeFailure::Timeout) => Self::Timeout,
            ChallengeOutcome::Fail(_) => Self::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChallengeParams {
    pub p1_threshold_deg: f32,
    pub p2_threshold_deg: f32,
    pub timeout: Duration,
    pub min_dynamics_difference_deg: f32,
}

impl Default for ChallengeParams {
    fn default() -> Self {
        Self {
            p1_threshold_deg: DEFAULT_P1_THRESHOLD_DEG,
            p2_threshold_deg: DEFAULT_P2_THRESHOLD_DEG,
            timeout: DEFAULT_CHALLENGE_TIMEOUT,
            min_dynamics_difference_deg: DEFAULT_MIN_DYNAMICS_DIFFERENCE_DEG,
        }
    }
}

/// Serializable summary of a session.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeReport {
    pub direction: ChallengeDirection,
    pub phase: ChallengePhase,
    pub status: ChallengeStatus,
    pub outcome: Option<ChallengeOutcome>,
    pub yaw_p1_to_p2: Vec<f32>,
    pub yaw_p2_to_p3: Vec<f32>,
    pub elapsed_ms: Option<u64>,
}

/// One head-turn challenge. Feed yaw samples in capture order.
#[derive(Debug, Clone)]
pub struct ChallengeSession {
    direction: ChallengeDirection,
    params: ChallengeParams,
    phase: ChallengePhase,
    yaw_p1_to_p2: Vec<f32>,
    yaw_p2_to_p3: Vec<f32>,
    /// Previous yaw toward the requested side while awaiting P1.
    previous_toward: Option<f32>,
    started_at: Option<Instant>,
    last_sample_at: Option<Instant>,
    outcome: Option<ChallengeOutcome>,
}

impl ChallengeSession {
    pub fn new(direction: ChallengeDirection) -> Self {
        Self::with_params(direction, ChallengeParams::default())
    }

    pub fn with_params(direction: ChallengeDirection, params: ChallengeParams) -> Self {
        Self {
            direction,
            params,
            phase: ChallengePhase::Idle,
            yaw_p1_to_p2: Vec::new(),
            yaw_p2_to_p3: Vec::new(),
            previous_toward: None,
            started_at: None,
            last_sample_at: None,
            outcome: None,
        }
    }

    pub fn direction(&self) -> ChallengeDirection {
        self.direction
    }

    pub fn phase(&self) -> ChallengePhase {
        self.phase
    }

    pub fn outcome(&self) -> Option<ChallengeOutcome> {
        self.outcome
    }

    pub fn yaw_p1_to_p2(&self) -> &[f32] {
        &self.yaw_p1_to_p2
    }

    pub fn yaw_p2_to_p3(&self) -> &[f32] {
        &self.yaw_p2_to_p3
    }

    pub fn status(&self) -> ChallengeStatus {
        self.outcome
            .map(ChallengeStatus::from)
            .unwrap_or(ChallengeStatus::InProgress)
    }

    /// Begin the session; the timeout counts from `at`.
    ///
    /// # Panics
    ///
    /// Panics if the session was already started.
    pub fn start(&mut self, at: Instant) {
        assert_eq!(
            self.phase,
            ChallengePhase::Idle,
            "challenge session started twice"
        );
        self.phase = ChallengePhase::AwaitingP1;
        self.started_at = Some(at);
        tracing::info!(direction = ?self.direction, "challenge started");
    }

    /// Feed one yaw sample (degrees) captured at `at`.
    ///
    /// Terminal sessions ignore further samples and keep their status.
    ///
    /// # Panics
    ///
    /// Panics if the session was never started, or if `at` is not strictly
    /// later than the previous sample.
    pub fn process(&mut self, yaw: f32, at: Instant) -> ChallengeStatus {
        if self.outcome.is_some() {
            return self.status();
        }
        self.accept_instant(at);
        if self.timed_out(at) {
            return self.finish(ChallengeOutcome::Fail(ChallengeFailure::Timeout));
        }
        if !yaw.is_finite() {
            tracing::debug!(yaw, "challenge: ignoring non-finite yaw");
            return ChallengeStatus::InProgress;
        }

        let toward = yaw * self.direction.sign();
        let p1 = self.params.p1_threshold_deg;
        let p2 = self.params.p2_threshold_deg;

        match self.phase {
            ChallengePhase::AwaitingP1 => {
                // A centered head alone is not a turn onset; it must also move
                // toward the requested side.
                let turning = self.previous_toward.is_some_and(|prev| toward > prev);
                self.previous_toward = Some(toward);
                if toward < p1 && turning {
                    self.advance(ChallengePhase::AwaitingP2, yaw);
                    self.yaw_p1_to_p2.push(yaw);
                }
            }
            ChallengePhase::AwaitingP2 => {
                self.yaw_p1_to_p2.push(yaw);
                if toward > p2 {
                    self.advance(ChallengePhase::AwaitingP3, yaw);
                    // The turning point anchors the return leg.
                    self.yaw_p2_to_p3.push(yaw);
                }
            }
            ChallengePhase::AwaitingP3 => {
                self.yaw_p2_to_p3.push(yaw);
                if toward < p1 {
                    self.advance(ChallengePhase::Done, yaw);
                    return self.finish(self.verify_movement());
                }
            }
            ChallengePhase::Idle | ChallengePhase::Done => unreachable!("guarded above"),
        }

        ChallengeStatus::InProgress
    }

    /// Face tracking was lost; fails immediately from any non-terminal
    /// phase, including before `start()`.
    pub fn face_lost(&mut self, at: Instant) -> ChallengeStatus {
        if self.outcome.is_some() {
            return self.status();
        }
        if self.phase != ChallengePhase::Idle {
            self.accept_instant(at);
        }
        tracing::info!(phase = ?self.phase, "challenge: face lost");
        self.finish(ChallengeOutcome::Fail(ChallengeFailure::FaceLost))
    }

    /// Expire the session if its timeout has elapsed at `now`, for callers
    /// whose yaw stream has gone quiet.
    pub fn check_timeout(&mut self, now: Instant) -> ChallengeStatus {
        if self.outcome.is_none() && self.phase != ChallengePhase::Idle && self.timed_out(now) {
            return self.finish(ChallengeOutcome::Fail(ChallengeFailure::Timeout));
        }
        self.status()
    }

    pub fn report(&self) -> ChallengeReport {
        ChallengeReport {
            direction: self.direction,
            phase: self.phase,
            status: self.status(),
            outcome: self.outcome,
            yaw_p1_to_p2: self.yaw_p1_to_p2.clone(),
            yaw_p2_to_p3: self.yaw_p2_to_p3.clone(),
            elapsed_ms: self.started_at.zip(self.last_sample_at).map(|(start, last)| {
                last.saturating_duration_since(start).as_millis() as u64
            }),
        }
    }

    fn accept_instant(&mut self, at: Instant) {
        assert!(
            self.phase != ChallengePhase::Idle,
            "challenge sample received before start()"
        );
        if let Some(last) = self.last_sample_at {
            assert!(
                at > last,
                "challenge samples must arrive in capture order without duplicates"
            );
        }
        self.last_sample_at = Some(at);
    }

    fn timed_out(&self, now: Instant) -> bool {
        self.started_at
            .is_some_and(|start| now.saturating_duration_since(start) >= self.params.timeout)
    }

    fn advance(&mut self, next: ChallengePhase, yaw: f32) {
        tracing::debug!(from = ?self.phase, to = ?next, yaw, "challenge phase reached");
        self.phase = next;
    }

    fn finish(&mut self, outcome: ChallengeOutcome) -> ChallengeStatus {
        self.phase = ChallengePhase::Done;
        self.outcome = Some(outcome);
        tracing::info!(
            ?outcome,
            outward = self.yaw_p1_to_p2.len(),
            inward = self.yaw_p2_to_p3.len(),
            "challenge finished"
        );
        self.status()
    }

    fn verify_movement(&self) -> ChallengeOutcome {
        let outward = &self.yaw_p1_to_p2;
        let inward = &self.yaw_p2_to_p3;

        if sorted(outward) == sorted(inward) {
            return ChallengeOutcome::Fail(ChallengeFailure::StaticMotion);
        }

        let sign = self.direction.sign();
        if !mostly_trending(outward, sign) || !mostly_trending(inward, -sign) {
            return ChallengeOutcome::Fail(ChallengeFailure::WrongTrend);
        }

        let (Some(out_speed), Some(in_speed)) = (mean_abs_step(outward), mean_abs_step(inward))
        else {
            return ChallengeOutcome::Fail(ChallengeFailure::WrongTrend);
        };
        if (out_speed - in_speed).abs() < self.params.min_dynamics_difference_deg {
            return ChallengeOutcome::Fail(ChallengeFailure::UniformDynamics);
        }

        ChallengeOutcome::Pass
    }
}

fn sorted(values: &[f32]) -> Vec<f32> {
    let mut v = values.to_vec();
    v.sort_by(f32::total_cmp);
    v
}

/// Strict majority of consecutive steps move in the `sign` direction.
///
/// Tolerates sensor jitter that strict monotonicity would not.
fn mostly_trending(values: &[f32], sign: f32) -> bool {
    let steps = values.len().saturating_sub(1);
    if steps == 0 {
        return false;
    }
    let with_trend = values
        .windows(2)
        .filter(|w| (w[1] - w[0]) * sign > 0.0)
        .count();
    2 * with_trend > steps
}

fn mean_abs_step(values: &[f32]) -> Option<f32> {
    if values.len() < 2 {
        return None;
    }
    let total: f32 = values.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    Some(total / (values.len() - 1) as f32)
}
