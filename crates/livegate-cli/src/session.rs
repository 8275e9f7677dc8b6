use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use livegate_core::{
    extract, ChallengeDirection, ChallengeParams, ChallengeReport, ChallengeSession,
    ChallengeStatus, FrameEvaluation, LivenessEngine, PersonalizedThresholds, ThresholdSource,
    Verdict,
};
use serde::Serialize;

use crate::recording::{self, FrameRecord, YawRecord};

/// Timing and fallback settings for one verification.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub primary_window: Duration,
    pub challenge_timeout: Duration,
    pub challenge_enabled: bool,
}

/// Which path produced the final verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPath {
    /// A depth frame inside the primary window was judged live.
    DepthLive,
    /// No frame in the primary window contained a face.
    NoFace,
    /// The window expired and the challenge is disabled.
    WindowExpired,
    /// The head-turn challenge decided.
    Challenge,
}

/// Serializable outcome of one verification.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub live: bool,
    pub decided_by: DecisionPath,
    pub threshold_source: ThresholdSource,
    pub frames_evaluated: usize,
    pub frames_insufficient: usize,
    pub best_checks_passed: usize,
    pub live_at_ms: Option<u64>,
    pub challenge: Option<ChallengeReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub evaluations: Vec<FrameEvaluation>,
}

/// Run one verification over recorded frames, falling back to the
/// head-turn challenge on `yaws` when the depth window is inconclusive.
///
/// Frames are consumed in capture order; frames captured after the primary
/// window are ignored. Yaw times are relative to the challenge start.
/// Frame and yaw times must strictly increase.
pub fn run_verification(
    frames: &[FrameRecord],
    yaws: &[YawRecord],
    thresholds: Option<&PersonalizedThresholds>,
    direction: ChallengeDirection,
    config: &SessionConfig,
    keep_evaluations: bool,
) -> Result<SessionReport> {
    recording::ensure_increasing(frames.iter().map(|f| f.t_ms), "frame")?;
    recording::ensure_increasing(yaws.iter().map(|y| y.t_ms), "yaw")?;

    let session_id = uuid::Uuid::new_v4().to_string();
    let base = Instant::now();

    let mut engine = LivenessEngine::new(thresholds);
    engine.reset();

    let mut evaluations = Vec::new();
    let mut frames_evaluated = 0;
    let mut frames_insufficient = 0;
    let mut best_checks_passed = 0;
    let mut face_seen = false;
    let mut live_at_ms = None;

    for frame in frames {
        if frame.t_ms >= config.primary_window.as_millis() as u64 {
            break;
        }
        if !frame.face {
            continue;
        }
        face_seen = true;

        let captured_at = offset(base, frame.t_ms)?;
        let eval = engine.evaluate(&extract(&frame.depth), captured_at);
        frames_evaluated += 1;
        if eval.verdict == Verdict::InsufficientData {
            frames_insufficient += 1;
        }
        best_checks_passed = best_checks_passed.max(eval.checks_passed);
        let live = eval.is_live();
        if keep_evaluations {
            evaluations.push(eval);
        }
        if live {
            live_at_ms = Some(frame.t_ms);
            break;
        }
    }

    let threshold_source = engine.bounds().source;
    let (live, decided_by, challenge) = if live_at_ms.is_some() {
        (true, DecisionPath::DepthLive, None)
    } else if !face_seen {
        (false, DecisionPath::NoFace, None)
    } else if !config.challenge_enabled {
        (false, DecisionPath::WindowExpired, None)
    } else {
        tracing::info!(
            session = %session_id,
            direction = ?direction,
            "depth window inconclusive — starting head-turn challenge"
        );
        let report = run_challenge(yaws, direction, config.challenge_timeout)?;
        (report.status == ChallengeStatus::Pass, DecisionPath::Challenge, Some(report))
    };

    tracing::info!(
        session = %session_id,
        live,
        decided_by = ?decided_by,
        frames_evaluated,
        best_checks_passed,
        "verification finished"
    );

    Ok(SessionReport {
        session_id,
        live,
        decided_by,
        threshold_source,
        frames_evaluated,
        frames_insufficient,
        best_checks_passed,
        live_at_ms,
        challenge,
        evaluations,
    })
}

/// Run a head-turn challenge over a recorded yaw stream.
///
/// A stream that ends before the session decides is held open until the
/// timeout elapses. Yaw times must strictly increase.
pub fn run_challenge(
    yaws: &[YawRecord],
    direction: ChallengeDirection,
    timeout: Duration,
) -> Result<ChallengeReport> {
    recording::ensure_increasing(yaws.iter().map(|y| y.t_ms), "yaw")?;

    let base = Instant::now();
    let deadline = base
        .checked_add(timeout)
        .context("challenge timeout out of range")?;
    let mut session = ChallengeSession::with_params(
        direction,
        ChallengeParams {
            timeout,
            ..ChallengeParams::default()
        },
    );
    session.start(base);

    for record in yaws {
        // Offset by 1 ms so a sample at t=0 is strictly after the start instant.
        let t_ms = record
            .t_ms
            .checked_add(1)
            .with_context(|| format!("yaw t_ms {} out of range", record.t_ms))?;
        let at = offset(base, t_ms)?;
        let status = match record.yaw {
            Some(yaw) => session.process(yaw, at),
            None => session.face_lost(at),
        };
        if status != ChallengeStatus::InProgress {
            break;
        }
    }

    session.check_timeout(deadline);
    Ok(session.report())
}

fn offset(base: Instant, t_ms: u64) -> Result<Instant> {
    base.checked_add(Duration::from_millis(t_ms))
        .with_context(|| format!("t_ms {t_ms} out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            primary_window: Duration::from_secs(5),
            challenge_timeout: Duration::from_secs(10),
            challenge_enabled: true,
        }
    }

    /// Face-like dome with texture, shifted by `offset` meters.
    fn face_grid(offset: f32) -> Vec<f32> {
        (0..100)
            .map(|i| {
                let (r, c) = ((i / 10) as f32, (i % 10) as f32);
                let dist2 = (r - 4.5).powi(2) + (c - 4.5).powi(2);
                let texture = ((i * 7 + (i / 10) * 13) % 11) as f32 * 0.003;
                0.45 + 0.004 * dist2 + texture + offset
            })
            .collect()
    }

    fn frame(t_ms: u64, depth: Vec<f32>) -> FrameRecord {
        FrameRecord {
            t_ms,
            depth,
            face: true,
        }
    }

    fn yaw_stream(values: &[f32]) -> Vec<YawRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, &y)| YawRecord {
                t_ms: i as u64 * 100,
                yaw: Some(y),
            })
            .collect()
    }

    const HAPPY_LEFT: [f32; 9] = [0.0, -2.0, 3.0, 10.0, 20.0, 26.0, 15.0, 10.0, 4.0];

    #[test]
    fn test_live_face_decided_by_depth() {
        let frames = vec![frame(0, vec![0.6; 100]), frame(33, face_grid(0.0))];
        let report = run_verification(
            &frames,
            &[],
            None,
            ChallengeDirection::TurnLeft,
            &config(),
            true,
        )
        .unwrap();
        assert!(report.live);
        assert_eq!(report.decided_by, DecisionPath::DepthLive);
        assert_eq!(report.live_at_ms, Some(33));
        assert_eq!(report.frames_evaluated, 2);
        assert_eq!(report.evaluations.len(), 2);
        assert!(report.challenge.is_none());
        assert_eq!(report.threshold_source, ThresholdSource::Default);
    }

    #[test]
    fn test_flat_photo_falls_back_to_challenge() {
        let frames: Vec<FrameRecord> = (0..10).map(|i| frame(i * 100, vec![0.6; 100])).collect();
        let report = run_verification(
            &frames,
            &yaw_stream(&HAPPY_LEFT),
            None,
            ChallengeDirection::TurnLeft,
            &config(),
            false,
        )
        .unwrap();
        assert_eq!(report.decided_by, DecisionPath::Challenge);
        assert!(report.live);
        assert!(report.evaluations.is_empty());
        assert_eq!(report.challenge.unwrap().status, ChallengeStatus::Pass);
    }

    #[test]
    fn test_no_face_skips_challenge() {
        let frames = vec![FrameRecord {
            t_ms: 0,
            depth: face_grid(0.0),
            face: false,
        }];
        let report = run_verification(
            &frames,
            &yaw_stream(&HAPPY_LEFT),
            None,
            ChallengeDirection::TurnLeft,
            &config(),
            false,
        )
        .unwrap();
        assert!(!report.live);
        assert_eq!(report.decided_by, DecisionPath::NoFace);
        assert_eq!(report.frames_evaluated, 0);
    }

    #[test]
    fn test_frames_after_window_ignored() {
        let frames = vec![frame(0, vec![0.6; 100]), frame(5_000, face_grid(0.0))];
        let cfg = SessionConfig {
            challenge_enabled: false,
            ..config()
        };
        let report =
            run_verification(&frames, &[], None, ChallengeDirection::TurnLeft, &cfg, false).unwrap();
        assert!(!report.live);
        assert_eq!(report.decided_by, DecisionPath::WindowExpired);
        assert_eq!(report.frames_evaluated, 1);
    }

    #[test]
    fn test_insufficient_frames_counted() {
        let frames = vec![frame(0, vec![0.5; 10]), frame(100, vec![0.0; 100])];
        let report = run_verification(
            &frames,
            &[],
            None,
            ChallengeDirection::TurnRight,
            &config(),
            false,
        )
        .unwrap();
        assert_eq!(report.frames_insufficient, 2);
        assert_eq!(report.decided_by, DecisionPath::Challenge);
        // Empty yaw stream: held open until timeout
        assert_eq!(report.challenge.unwrap().status, ChallengeStatus::Timeout);
        assert!(!report.live);
    }

    #[test]
    fn test_challenge_face_lost() {
        let mut yaws = yaw_stream(&[0.0, 8.0, 15.0]);
        yaws.push(YawRecord {
            t_ms: 300,
            yaw: None,
        });
        let report =
            run_challenge(&yaws, ChallengeDirection::TurnLeft, Duration::from_secs(10)).unwrap();
        assert_eq!(report.status, ChallengeStatus::Fail);
    }

    #[test]
    fn test_challenge_wrong_direction_times_out() {
        let report = run_challenge(
            &yaw_stream(&HAPPY_LEFT),
            ChallengeDirection::TurnRight,
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(report.status, ChallengeStatus::Timeout);
    }

    #[test]
    fn test_unordered_yaw_times_rejected() {
        let duplicate = vec![
            YawRecord {
                t_ms: 0,
                yaw: Some(0.0),
            },
            YawRecord {
                t_ms: 0,
                yaw: Some(3.0),
            },
        ];
        let err = run_challenge(&duplicate, ChallengeDirection::TurnLeft, Duration::from_secs(10))
            .unwrap_err();
        assert!(err.to_string().contains("not after previous"));

        let mut reversed = yaw_stream(&HAPPY_LEFT);
        reversed.reverse();
        let result = run_challenge(&reversed, ChallengeDirection::TurnLeft, Duration::from_secs(10));
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_range_yaw_time_rejected() {
        let yaws = vec![YawRecord {
            t_ms: u64::MAX,
            yaw: Some(0.0),
        }];
        let err = run_challenge(&yaws, ChallengeDirection::TurnLeft, Duration::from_secs(10))
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_unordered_frames_rejected() {
        let frames = vec![frame(100, face_grid(0.0)), frame(50, face_grid(0.001))];
        let result = run_verification(
            &frames,
            &[],
            None,
            ChallengeDirection::TurnLeft,
            &config(),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_personalized_source_reported() {
        let thresholds = PersonalizedThresholds {
            calculation_date: chrono::Utc::now(),
            min_mean_depth: 0.4,
            max_mean_depth: 0.7,
            min_std_dev: 0.02,
            min_range: 0.05,
            min_edge_std_dev: 0.02,
            min_center_std_dev: 0.005,
            max_gradient_mean: 0.5,
            min_gradient_std_dev: 0.001,
        };
        let frames = vec![frame(0, face_grid(0.0))];
        let report = run_verification(
            &frames,
            &[],
            Some(&thresholds),
            ChallengeDirection::TurnLeft,
            &config(),
            false,
        )
        .unwrap();
        assert_eq!(report.threshold_source, ThresholdSource::Personalized);
        assert!(report.live);
    }
}
