//! Depth grid feature extraction.
//!
//! The acquisition layer samples each depth frame on a fixed 10×10 grid
//! across the detected face region. This module turns one such grid into a
//! [`FrameSample`] holding the valid depths and derived subsets, plus its
//! [`FrameStatistics`]. Extraction is pure: the same grid always yields the
//! same sample, so frames may be extracted in parallel ahead of the
//! (sequential) decision engine.
//!
//! # Derived subsets
//!
//! - **edge**: cells on the grid border (36 cells).
//! - **center**: the inner 6×6 block (36 cells).
//! - **gradient field**: absolute depth difference between every cell and its
//!   right and bottom neighbours (180 slots). A slot is `NaN` when either
//!   cell is invalid, so slot positions stay aligned across frames.

use crate::types::FrameStatistics;

/// Grid side length.
pub const GRID_SIZE: usize = 10;
/// Number of cells in one grid.
pub const GRID_CELLS: usize = GRID_SIZE * GRID_SIZE;
/// Number of slots in the gradient field: right pairs plus bottom pairs.
pub const GRADIENT_SLOTS: usize = 2 * GRID_SIZE * (GRID_SIZE - 1);
/// Fewer valid depths than this and a frame carries no usable statistics.
pub const MIN_VALID_SAMPLES: usize = 30;

/// Inner block bounds (inclusive start, exclusive end) for the center subset.
const CENTER_START: usize = 2;
const CENTER_END: usize = GRID_SIZE - 2;

/// Valid depths of one frame plus the derived subsets.
#[derive(Debug, Clone)]
pub struct FrameSample {
    values: Vec<f32>,
    edge: Vec<f32>,
    center: Vec<f32>,
    gradient_field: Vec<f32>,
    statistics: FrameStatistics,
}

/// Result of extracting one depth grid.
#[derive(Debug, Clone)]
pub enum Extraction {
    Sample(FrameSample),
    /// Too few valid cells; carries the valid count that was found.
    Insufficient { valid: usize },
}

impl Extraction {
    pub fn valid_samples(&self) -> usize {
        match self {
            Self::Sample(s) => s.values.len(),
            Self::Insufficient { valid } => *valid,
        }
    }
}

/// Extract a frame sample from a row-major depth grid in meters.
///
/// Cells that are non-positive, non-finite or beyond the supplied slice are
/// treated as invalid. Values past the first [`GRID_CELLS`] are ignored.
pub fn extract(grid: &[f32]) -> Extraction {
    let cell = |row: usize, col: usize| -> Option<f32> {
        grid.get(row * GRID_SIZE + col)
            .copied()
            .filter(|d| d.is_finite() && *d > 0.0)
    };

    let mut values = Vec::with_capacity(GRID_CELLS);
    let mut edge = Vec::with_capacity(4 * (GRID_SIZE - 1));
    let mut center = Vec::with_capacity((CENTER_END - CENTER_START).pow(2));
    let mut gradient_field = Vec::with_capacity(GRADIENT_SLOTS);

    for row in 0..GRID_SIZE {
        for col in 0..GRID_SIZE {
            let here = cell(row, col);

            if let Some(d) = here {
                values.push(d);
                if row == 0 || col == 0 || row == GRID_SIZE - 1 || col == GRID_SIZE - 1 {
                    edge.push(d);
                }
                if (CENTER_START..CENTER_END).contains(&row)
                    && (CENTER_START..CENTER_END).contains(&col)
                {
                    center.push(d);
                }
            }

            // Right then bottom neighbour; each adjacent pair is visited once.
            if col + 1 < GRID_SIZE {
                gradient_field.push(abs_diff(here, cell(row, col + 1)));
            }
            if row + 1 < GRID_SIZE {
                gradient_field.push(abs_diff(here, cell(row + 1, col)));
            }
        }
    }

    if values.len() < MIN_VALID_SAMPLES {
        return Extraction::Insufficient {
            valid: values.len(),
        };
    }

    let (mean, std_dev) = mean_std(&values);
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let gradients: Vec<f32> = gradient_field
        .iter()
        .copied()
        .filter(|g| g.is_finite())
        .collect();
    let (gradient_mean, gradient_std_dev) = mean_std(&gradients);

    let statistics = FrameStatistics {
        mean,
        std_dev,
        range: max - min,
        edge_std_dev: mean_std(&edge).1,
        center_std_dev: mean_std(&center).1,
        gradient_mean,
        gradient_std_dev,
    };

    Extraction::Sample(FrameSample {
        values,
        edge,
        center,
        gradient_field,
        statistics,
    })
}

impl FrameSample {
    /// All valid depths in row-major order.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn edge(&self) -> &[f32] {
        &self.edge
    }

    pub fn center(&self) -> &[f32] {
        &self.center
    }

    /// Positional gradient field; invalid slots are `NaN`.
    pub fn gradient_field(&self) -> &[f32] {
        &self.gradient_field
    }

    pub fn statistics(&self) -> &FrameStatistics {
        &self.statistics
    }
}

fn abs_diff(a: Option<f32>, b: Option<f32>) -> f32 {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs(),
        _ => f32::NAN,
    }
}

/// Population mean and standard deviation. Empty input yields `(0, 0)`.
///
/// Accumulates in `f64` so nearly identical depths do not lose their spread.
pub(crate) fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean as f32, variance.sqrt() as f32)
}
