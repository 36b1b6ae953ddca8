//! Memory layout of a strided 3-D volume.

use serde::{Deserialize, Serialize};

use super::region::VoxelBox;

/// Dimensions plus the padding increments of a flattened x-fastest volume.
///
/// `inc_y` is the number of elements skipped at the end of every row and
/// `inc_z` the number skipped at the end of every slice, so the element
/// following voxel `(dim_x - 1, y, z)` in memory is `inc_y` elements before
/// voxel `(0, y + 1, z)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeLayout {
    dims: [usize; 3],
    inc_y: usize,
    inc_z: usize,
}

impl VolumeLayout {
    /// Contiguous layout without padding.
    pub fn new(dims: [usize; 3]) -> Self {
        Self {
            dims,
            inc_y: 0,
            inc_z: 0,
        }
    }

    /// Layout with explicit row and slice padding.
    pub fn with_padding(dims: [usize; 3], inc_y: usize, inc_z: usize) -> Self {
        Self { dims, inc_y, inc_z }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn inc_y(&self) -> usize {
        self.inc_y
    }

    pub fn inc_z(&self) -> usize {
        self.inc_z
    }

    /// Distance in elements between `(x, y, z)` and `(x, y + 1, z)`.
    pub fn row_stride(&self) -> usize {
        self.dims[0] + self.inc_y
    }

    /// Distance in elements between `(x, y, z)` and `(x, y, z + 1)`.
    pub fn slice_stride(&self) -> usize {
        self.row_stride() * self.dims[1] + self.inc_z
    }

    /// Number of elements a buffer with this layout must hold.
    pub fn buffer_len(&self) -> usize {
        self.slice_stride() * self.dims[2]
    }

    /// Number of addressable voxels.
    pub fn voxel_count(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn is_contiguous(&self) -> bool {
        self.inc_y == 0 && self.inc_z == 0
    }

    #[inline]
    pub fn offset(&self, x: usize, y: usize, z: usize) -> usize {
        x + y * self.row_stride() + z * self.slice_stride()
    }

    /// Whether an integer coordinate lies inside the volume.
    #[inline]
    pub fn contains(&self, x: i64, y: i64, z: i64) -> bool {
        x >= 0
            && y >= 0
            && z >= 0
            && (x as usize) < self.dims[0]
            && (y as usize) < self.dims[1]
            && (z as usize) < self.dims[2]
    }

    /// Centre of the voxel grid, `(length - 1) / 2` per axis.
    pub fn mid(&self) -> [f64; 3] {
        [
            (self.dims[0] as f64 - 1.0) * 0.5,
            (self.dims[1] as f64 - 1.0) * 0.5,
            (self.dims[2] as f64 - 1.0) * 0.5,
        ]
    }

    /// Offset of the first voxel of `region` in this layout.
    pub fn region_jump(&self, region: &VoxelBox) -> usize {
        let min = region.min();
        self.offset(min[0], min[1], min[2])
    }

    /// Increments to skip at the end of a row and a slice when walking
    /// `region` inside this layout.
    pub fn region_increments(&self, region: &VoxelBox) -> (usize, usize) {
        let lengths = region.lengths();
        let inc_y = self.row_stride() - lengths[0];
        let inc_z = self.slice_stride() - lengths[1] * self.row_stride();
        (inc_y, inc_z)
    }

    /// Same dimensions, ignoring padding.
    pub fn same_dims(&self, other: &VolumeLayout) -> bool {
        self.dims == other.dims
    }
}
