//! Region-of-interest boxes.
//!
//! [`RegionBox`] is the user-facing segmentation boundary with 1-based
//! inclusive bounds. [`VoxelBox`] is the 0-based inclusive box used by the
//! numerical kernels.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SegmentationError};

/// Segmentation boundary with 1-based, inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionBox {
    min: [usize; 3],
    max: [usize; 3],
}

impl RegionBox {
    /// Create a region box. Requires `1 <= min <= max` per axis.
    pub fn new(min: [usize; 3], max: [usize; 3]) -> Result<Self> {
        for axis in 0..3 {
            if min[axis] < 1 || min[axis] > max[axis] {
                return Err(SegmentationError::input_mismatch(format!(
                    "segmentation boundary axis {} is invalid: min {} max {}",
                    axis, min[axis], max[axis]
                )));
            }
        }
        Ok(Self { min, max })
    }

    /// Box covering a whole volume of the given dimensions.
    pub fn full(dims: [usize; 3]) -> Self {
        Self {
            min: [1, 1, 1],
            max: [dims[0].max(1), dims[1].max(1), dims[2].max(1)],
        }
    }

    pub fn min(&self) -> [usize; 3] {
        self.min
    }

    pub fn max(&self) -> [usize; 3] {
        self.max
    }

    /// Check `1 <= min <= dim` and `min <= max <= dim` on every axis.
    pub fn validate_against(&self, dims: [usize; 3]) -> Result<()> {
        for axis in 0..3 {
            if self.min[axis] < 1 || self.min[axis] > dims[axis] {
                return Err(SegmentationError::input_mismatch(format!(
                    "boundary min {} on axis {} is outside [1, {}]",
                    self.min[axis], axis, dims[axis]
                )));
            }
            if self.max[axis] < self.min[axis] || self.max[axis] > dims[axis] {
                return Err(SegmentationError::input_mismatch(format!(
                    "boundary max {} on axis {} is outside [{}, {}]",
                    self.max[axis], axis, self.min[axis], dims[axis]
                )));
            }
        }
        Ok(())
    }

    pub fn lengths(&self) -> [usize; 3] {
        [
            self.max[0] - self.min[0] + 1,
            self.max[1] - self.min[1] + 1,
            self.max[2] - self.min[2] + 1,
        ]
    }

    pub fn voxel_count(&self) -> usize {
        let l = self.lengths();
        l[0] * l[1] * l[2]
    }

    /// The same box in 0-based voxel coordinates.
    pub fn to_voxel_box(&self) -> VoxelBox {
        VoxelBox {
            min: [self.min[0] - 1, self.min[1] - 1, self.min[2] - 1],
            max: [self.max[0] - 1, self.max[1] - 1, self.max[2] - 1],
        }
    }
}

/// 0-based inclusive voxel box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoxelBox {
    min: [usize; 3],
    max: [usize; 3],
}

impl VoxelBox {
    /// Create a box; `min` and `max` are swapped per axis if given reversed.
    pub fn new(min: [usize; 3], max: [usize; 3]) -> Self {
        let mut lo = min;
        let mut hi = max;
        for axis in 0..3 {
            if lo[axis] > hi[axis] {
                std::mem::swap(&mut lo[axis], &mut hi[axis]);
            }
        }
        Self { min: lo, max: hi }
    }

    /// Box covering a whole volume.
    pub fn full(dims: [usize; 3]) -> Self {
        Self {
            min: [0, 0, 0],
            max: [
                dims[0].saturating_sub(1),
                dims[1].saturating_sub(1),
                dims[2].saturating_sub(1),
            ],
        }
    }

    pub fn min(&self) -> [usize; 3] {
        self.min
    }

    pub fn max(&self) -> [usize; 3] {
        self.max
    }

    pub fn lengths(&self) -> [usize; 3] {
        [
            self.max[0] - self.min[0] + 1,
            self.max[1] - self.min[1] + 1,
            self.max[2] - self.min[2] + 1,
        ]
    }

    pub fn voxel_count(&self) -> usize {
        let l = self.lengths();
        l[0] * l[1] * l[2]
    }

    pub fn contains(&self, p: [usize; 3]) -> bool {
        (0..3).all(|a| p[a] >= self.min[a] && p[a] <= self.max[a])
    }

    /// Linear index of an absolute coordinate inside this box (x fastest).
    pub fn local_index(&self, p: [usize; 3]) -> usize {
        let l = self.lengths();
        (p[0] - self.min[0]) + (p[1] - self.min[1]) * l[0] + (p[2] - self.min[2]) * l[0] * l[1]
    }

    /// Absolute coordinate of the `index`-th voxel of this box.
    pub fn coordinate(&self, index: usize) -> [usize; 3] {
        let l = self.lengths();
        let xy = l[0] * l[1];
        let z = index / xy;
        let rest = index % xy;
        [
            self.min[0] + rest % l[0],
            self.min[1] + rest / l[0],
            self.min[2] + z,
        ]
    }

    /// Intersection with another box, `None` when disjoint.
    pub fn intersect(&self, other: &VoxelBox) -> Option<VoxelBox> {
        let mut min = [0; 3];
        let mut max = [0; 3];
        for a in 0..3 {
            min[a] = self.min[a].max(other.min[a]);
            max[a] = self.max[a].min(other.max[a]);
            if min[a] > max[a] {
                return None;
            }
        }
        Some(VoxelBox { min, max })
    }

    /// Smallest box containing both boxes.
    pub fn union(&self, other: &VoxelBox) -> VoxelBox {
        let mut min = [0; 3];
        let mut max = [0; 3];
        for a in 0..3 {
            min[a] = self.min[a].min(other.min[a]);
            max[a] = self.max[a].max(other.max[a]);
        }
        VoxelBox { min, max }
    }

    /// Shift from box-relative to absolute coordinates.
    pub fn offset_by(&self, origin: [usize; 3]) -> VoxelBox {
        VoxelBox {
            min: [self.min[0] + origin[0], self.min[1] + origin[1], self.min[2] + origin[2]],
            max: [self.max[0] + origin[0], self.max[1] + origin[1], self.max[2] + origin[2]],
        }
    }
}
