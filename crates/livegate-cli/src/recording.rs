//! Recorded capture files replayed through the liveness core.
//!
//! Times are milliseconds from the start of the recording. Depth grids are
//! row-major 10×10 arrays in meters; non-positive cells mark missing depth.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use livegate_core::{extract, EnrollmentCaptureSet, Extraction, Pose};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// One recorded depth frame.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameRecord {
    pub t_ms: u64,
    pub depth: Vec<f32>,
    /// Whether the camera layer detected a face in this frame.
    #[serde(default = "face_present")]
    pub face: bool,
}

/// One recorded head-yaw sample; `None` means face tracking was lost.
#[derive(Debug, Clone, Deserialize)]
pub struct YawRecord {
    pub t_ms: u64,
    pub yaw: Option<f32>,
}

/// Enrollment recording: depth grids per pose.
pub type CaptureRecording = BTreeMap<Pose, Vec<Vec<f32>>>;

fn face_present() -> bool {
    true
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

/// Check that record times strictly increase.
///
/// The liveness core treats reordered or duplicated samples as a caller bug,
/// so recordings are rejected before replay.
pub fn ensure_increasing(times: impl IntoIterator<Item = u64>, kind: &str) -> Result<()> {
    let mut previous: Option<u64> = None;
    for (i, t_ms) in times.into_iter().enumerate() {
        if let Some(prev) = previous {
            if t_ms <= prev {
                bail!("{kind} record {i}: t_ms {t_ms} is not after previous t_ms {prev}");
            }
        }
        previous = Some(t_ms);
    }
    Ok(())
}

/// Build an enrollment capture set from recorded grids.
///
/// Grids with insufficient depth data and grids beyond the per-pose cap are
/// skipped; the number skipped is returned alongside the set.
pub fn capture_set(recording: &CaptureRecording) -> (EnrollmentCaptureSet, usize) {
    let mut set = EnrollmentCaptureSet::new();
    let mut skipped = 0;

    for (pose, grids) in recording {
        for grid in grids {
            match extract(grid) {
                Extraction::Sample(sample) => {
                    if !set.push(*pose, *sample.statistics()) {
                        skipped += 1;
                    }
                }
                Extraction::Insufficient { valid } => {
                    tracing::debug!(pose = pose.as_str(), valid, "skipping sparse enrollment grid");
                    skipped += 1;
                }
            }
        }
    }

    (set, skipped)
}
