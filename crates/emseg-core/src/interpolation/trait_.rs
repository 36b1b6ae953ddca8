//! Interpolator trait for sampling volumes at continuous voxel coordinates.

use crate::volume::{Scalar, ScalarVolume, Volume, VolumeLayout};

/// Anything that can be read voxel-by-voxel through a [`VolumeLayout`].
pub trait VoxelSource {
    fn layout(&self) -> &VolumeLayout;

    /// Value stored at a raw buffer offset.
    fn value_at(&self, offset: usize) -> f64;
}

impl<T: Scalar> VoxelSource for Volume<T> {
    fn layout(&self) -> &VolumeLayout {
        Volume::layout(self)
    }

    #[inline]
    fn value_at(&self, offset: usize) -> f64 {
        self.as_slice()[offset].to_f64()
    }
}

impl VoxelSource for ScalarVolume {
    fn layout(&self) -> &VolumeLayout {
        ScalarVolume::layout(self)
    }

    #[inline]
    fn value_at(&self, offset: usize) -> f64 {
        ScalarVolume::value_at(self, offset)
    }
}

/// Interpolator trait for sampling values at continuous coordinates.
///
/// Coordinates are voxel indices `(x, y, z)`. Samples outside the volume
/// read as zero, so an atlas contributes no probability beyond its extent.
pub trait Interpolator {
    /// Sample `source` at the continuous coordinate `p`.
    fn sample<S: VoxelSource + ?Sized>(&self, source: &S, p: [f64; 3]) -> f64;
}
