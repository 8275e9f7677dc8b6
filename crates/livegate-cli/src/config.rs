use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use livegate_core::calibration::{CalibrationParams, DEFAULT_K, DEFAULT_MIN_CENTER_SAMPLES};

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database holding calibrated thresholds.
    pub db_path: PathBuf,
    /// Time budget for the passive depth window.
    pub primary_window_secs: u64,
    /// Timeout for the head-turn challenge.
    pub challenge_timeout_secs: u64,
    /// Whether the head-turn challenge runs when the depth window is inconclusive.
    pub challenge_enabled: bool,
    /// Standard deviations between enrollment mean and each calibrated bound.
    pub calibration_k: f32,
    /// Minimum Center-pose samples required to calibrate.
    pub min_center_samples: usize,
}

impl Config {
    /// Load configuration from `LIVEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("livegate");

        let db_path = std::env::var("LIVEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("thresholds.db"));

        Self {
            db_path,
            primary_window_secs: env_or("LIVEGATE_PRIMARY_WINDOW_SECS", 5),
            challenge_timeout_secs: env_or("LIVEGATE_CHALLENGE_TIMEOUT_SECS", 10),
            challenge_enabled: std::env::var("LIVEGATE_CHALLENGE_ENABLED")
                .map(|v| v != "0")
                .unwrap_or(true),
            calibration_k: env_or("LIVEGATE_CALIBRATION_K", DEFAULT_K),
            min_center_samples: env_or(
                "LIVEGATE_MIN_CENTER_SAMPLES",
                DEFAULT_MIN_CENTER_SAMPLES,
            ),
        }
    }

    pub fn primary_window(&self) -> Duration {
        Duration::from_secs(self.primary_window_secs)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    pub fn calibration_params(&self) -> CalibrationParams {
        CalibrationParams {
            k: self.calibration_k,
            min_center_samples: self.min_center_samples,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
