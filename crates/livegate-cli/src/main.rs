use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use livegate_core::{ChallengeDirection, PersonalizedThresholds, Pose, ThresholdCalibrator};
use livegate_store::ThresholdStore;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod config;
mod recording;
mod session;

use config::Config;
use recording::{CaptureRecording, FrameRecord, YawRecord};
use session::SessionConfig;

#[derive(Parser)]
#[command(name = "livegate", version, about = "Depth-camera face liveness verification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a recorded depth session, with the head-turn challenge as fallback
    Verify {
        /// JSON array of recorded depth frames
        #[arg(long)]
        frames: PathBuf,
        /// JSON array of recorded yaw samples for the challenge
        #[arg(long)]
        yaw: Option<PathBuf>,
        /// Use this user's calibrated thresholds when stored
        #[arg(long)]
        user: Option<String>,
        /// Challenge direction (random when omitted)
        #[arg(long, value_enum)]
        direction: Option<DirectionArg>,
        /// Include every per-frame evaluation in the report
        #[arg(long)]
        verbose: bool,
    },
    /// Derive and store personalized thresholds from an enrollment recording
    Calibrate {
        /// JSON object mapping pose names to arrays of depth grids
        #[arg(long)]
        capture: PathBuf,
        #[arg(long)]
        user: String,
    },
    /// Run only the head-turn challenge over a recorded yaw stream
    Challenge {
        #[arg(long)]
        yaw: PathBuf,
        #[arg(long, value_enum)]
        direction: DirectionArg,
    },
    /// Inspect or remove stored thresholds
    Thresholds {
        #[command(subcommand)]
        action: ThresholdsAction,
    },
}

#[derive(Subcommand)]
enum ThresholdsAction {
    /// Print a user's stored thresholds
    Show {
        #[arg(long)]
        user: String,
    },
    /// Delete a user's stored thresholds
    Remove {
        #[arg(long)]
        user: String,
    },
    /// List users with stored thresholds
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Left,
    Right,
}

impl From<DirectionArg> for ChallengeDirection {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Left => ChallengeDirection::TurnLeft,
            DirectionArg::Right => ChallengeDirection::TurnRight,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Command::Verify {
            frames,
            yaw,
            user,
            direction,
            verbose,
        } => verify(&config, &frames, yaw.as_deref(), user.as_deref(), direction, verbose).await,
        Command::Calibrate { capture, user } => calibrate(&config, &capture, &user).await,
        Command::Challenge { yaw, direction } => {
            let yaws: Vec<YawRecord> = recording::read_json(&yaw)?;
            let direction = ChallengeDirection::from(direction);
            eprintln!("{}", direction.prompt());
            let report = session::run_challenge(&yaws, direction, config.challenge_timeout())
                .context("challenge replay failed")?;
            print_json(&report)
        }
        Command::Thresholds { action } => thresholds(&config, action).await,
    }
}

async fn verify(
    config: &Config,
    frames_path: &Path,
    yaw_path: Option<&Path>,
    user: Option<&str>,
    direction: Option<DirectionArg>,
    verbose: bool,
) -> Result<()> {
    let frames: Vec<FrameRecord> = recording::read_json(frames_path)?;
    let yaws: Vec<YawRecord> = match yaw_path {
        Some(path) => recording::read_json(path)?,
        None => Vec::new(),
    };

    let thresholds = match user {
        Some(user) => load_thresholds(config, user).await,
        None => None,
    };
    if user.is_some() && thresholds.is_none() {
        tracing::info!("no calibrated thresholds for user — using defaults");
    }

    let direction = direction
        .map(ChallengeDirection::from)
        .unwrap_or_else(ChallengeDirection::random);
    let session_config = SessionConfig {
        primary_window: config.primary_window(),
        challenge_timeout: config.challenge_timeout(),
        challenge_enabled: config.challenge_enabled,
    };

    let report = session::run_verification(
        &frames,
        &yaws,
        thresholds.as_ref(),
        direction,
        &session_config,
        verbose,
    )
    .context("verification replay failed")?;
    print_json(&report)
}

#[derive(Serialize)]
struct CalibrationReport {
    user: String,
    calibrated: bool,
    samples_skipped: usize,
    missing_poses: Vec<Pose>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thresholds: Option<PersonalizedThresholds>,
}

async fn calibrate(config: &Config, capture_path: &Path, user: &str) -> Result<()> {
    let recording: CaptureRecording = recording::read_json(capture_path)?;
    let (capture, samples_skipped) = recording::capture_set(&recording);

    let calibrator = ThresholdCalibrator::new(config.calibration_params());
    let mut report = CalibrationReport {
        user: user.to_string(),
        calibrated: false,
        samples_skipped,
        missing_poses: capture.missing_poses(),
        error: None,
        thresholds: None,
    };

    match calibrator.calibrate(&capture) {
        Ok(thresholds) => {
            open_store(config)
                .await?
                .save(user, &thresholds)
                .await
                .context("failed to save thresholds")?;
            report.calibrated = true;
            report.thresholds = Some(thresholds);
        }
        Err(e) => {
            // Previously stored thresholds (or defaults) stay in effect.
            tracing::warn!(user, error = %e, "calibration failed — keeping existing thresholds");
            report.error = Some(e.to_string());
        }
    }

    print_json(&report)
}

async fn thresholds(config: &Config, action: ThresholdsAction) -> Result<()> {
    let store = open_store(config).await?;
    match action {
        ThresholdsAction::Show { user } => match store.load(&user).await {
            Some(t) => print_json(&t),
            None => print_json(&serde_json::json!({ "user": user, "thresholds": "default" })),
        },
        ThresholdsAction::Remove { user } => {
            let removed = store.remove(&user).await.context("failed to remove thresholds")?;
            print_json(&serde_json::json!({ "user": user, "removed": removed }))
        }
        ThresholdsAction::List => {
            let records = store.list().await.context("failed to list thresholds")?;
            print_json(&records)
        }
    }
}

/// Stored thresholds for `user`, or `None` when the store is unavailable.
async fn load_thresholds(config: &Config, user: &str) -> Option<PersonalizedThresholds> {
    match open_store(config).await {
        Ok(store) => store.load(user).await,
        Err(e) => {
            tracing::warn!(user, error = %e, "threshold store unavailable — using defaults");
            None
        }
    }
}

async fn open_store(config: &Config) -> Result<ThresholdStore> {
    ThresholdStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_db(db_path: &str) -> Config {
        Config {
            db_path: PathBuf::from(db_path),
            ..Config::from_env()
        }
    }

    #[tokio::test]
    async fn test_unavailable_store_falls_back_to_defaults() {
        // A directory cannot be created below /dev/null
        let config = config_with_db("/dev/null/livegate/thresholds.db");
        assert!(open_store(&config).await.is_err());
        assert!(load_thresholds(&config, "alice").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_user_loads_none() {
        let config = config_with_db(":memory:");
        assert!(load_thresholds(&config, "alice").await.is_none());
    }
}
