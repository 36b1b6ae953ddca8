//! Voxel spacing.
//!
//! Spacing represents the physical distance between adjacent voxels along
//! each axis. The EM engine only compares spacings for consistency; it never
//! resamples, so a plain array is enough.

use serde::{Deserialize, Serialize};
use std::ops::Index;

/// Spacing between adjacent voxels along x, y and z.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spacing(pub [f64; 3]);

/// Tolerance used when comparing spacings of different volumes.
pub const SPACING_TOLERANCE: f64 = 1e-6;

impl Spacing {
    /// Create spacing from per-axis values.
    pub fn new(values: [f64; 3]) -> Self {
        Self(values)
    }

    /// Create uniform spacing (same value for all dimensions).
    pub fn uniform(value: f64) -> Self {
        Self([value; 3])
    }

    /// Check if spacing is uniform (all components equal).
    pub fn is_uniform(&self) -> bool {
        (1..3).all(|i| (self.0[i] - self.0[0]).abs() < 1e-9)
    }

    /// Get the minimum spacing value.
    pub fn min_spacing(&self) -> f64 {
        self.0.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Get the maximum spacing value.
    pub fn max_spacing(&self) -> f64 {
        self.0.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Compare two spacings within [`SPACING_TOLERANCE`].
    pub fn matches(&self, other: &Spacing) -> bool {
        (0..3).all(|i| (self.0[i] - other.0[i]).abs() <= SPACING_TOLERANCE)
    }
}

impl Default for Spacing {
    fn default() -> Self {
        Self::uniform(1.0)
    }
}

impl Index<usize> for Spacing {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.0[index]
    }
}
