//! Nearest neighbor interpolation.

use super::trait_::{Interpolator, VoxelSource};
use crate::volume::VolumeLayout;

/// Nearest Neighbor Interpolator.
///
/// Rounds every coordinate to the closest voxel centre.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighborInterpolator;

impl NearestNeighborInterpolator {
    /// Create a new nearest neighbor interpolator.
    pub fn new() -> Self {
        Self
    }
}

/// Buffer offset of the voxel closest to `p`, `None` outside the volume.
#[inline]
pub fn nearest_offset(layout: &VolumeLayout, p: [f64; 3]) -> Option<usize> {
    let x = (p[0] + 0.5).floor() as i64;
    let y = (p[1] + 0.5).floor() as i64;
    let z = (p[2] + 0.5).floor() as i64;
    if layout.contains(x, y, z) {
        Some(layout.offset(x as usize, y as usize, z as usize))
    } else {
        None
    }
}

impl Interpolator for NearestNeighborInterpolator {
    #[inline]
    fn sample<S: VoxelSource + ?Sized>(&self, source: &S, p: [f64; 3]) -> f64 {
        match nearest_offset(source.layout(), p) {
            Some(offset) => source.value_at(offset),
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Volume;

    #[test]
    fn test_nearest_rounds() {
        let v = Volume::from_fn([3, 3, 1], |x, y, _| (x + 3 * y) as f32);
        let interp = NearestNeighborInterpolator::new();
        assert_eq!(interp.sample(&v, [0.4, 0.0, 0.0]), 0.0);
        assert_eq!(interp.sample(&v, [0.6, 0.0, 0.0]), 1.0);
        assert_eq!(interp.sample(&v, [1.5, 1.2, 0.1]), 5.0);
    }

    #[test]
    fn test_nearest_outside_is_zero() {
        let v = Volume::filled([2, 2, 2], 1.0f64);
        let interp = NearestNeighborInterpolator::new();
        assert_eq!(interp.sample(&v, [-0.6, 0.0, 0.0]), 0.0);
        assert_eq!(interp.sample(&v, [1.49, 1.0, 1.0]), 1.0);
        assert_eq!(interp.sample(&v, [1.5, 1.0, 1.0]), 0.0);
        assert!(nearest_offset(v.layout(), [0.0, 2.0, 0.0]).is_none());
    }
}
