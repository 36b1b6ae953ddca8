//! Trilinear interpolation.

use serde::{Deserialize, Serialize};

use super::trait_::{Interpolator, VoxelSource};

/// Trilinear interpolator.
///
/// Blends the eight voxels around `p`. Along an axis of length one the
/// single slice is used as is, which makes the same code serve 2-D data.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LinearInterpolator;

impl LinearInterpolator {
    /// Create a new linear interpolator.
    pub fn new() -> Self {
        Self
    }
}

/// Lower corner index and blend weight along one axis.
#[inline]
fn axis_weights(coord: f64, len: usize) -> Option<(usize, usize, f64)> {
    let upper = len as f64 - 1.0;
    if coord < 0.0 || coord > upper {
        return None;
    }
    let lo = coord.floor() as usize;
    let hi = (lo + 1).min(len - 1);
    Some((lo, hi, coord - lo as f64))
}

impl Interpolator for LinearInterpolator {
    fn sample<S: VoxelSource + ?Sized>(&self, source: &S, p: [f64; 3]) -> f64 {
        let layout = source.layout();
        let dims = layout.dims();
        let (Some((x0, x1, fx)), Some((y0, y1, fy)), Some((z0, z1, fz))) = (
            axis_weights(p[0], dims[0]),
            axis_weights(p[1], dims[1]),
            axis_weights(p[2], dims[2]),
        ) else {
            return 0.0;
        };

        let v = |x: usize, y: usize, z: usize| source.value_at(layout.offset(x, y, z));

        let c00 = v(x0, y0, z0) * (1.0 - fx) + v(x1, y0, z0) * fx;
        let c10 = v(x0, y1, z0) * (1.0 - fx) + v(x1, y1, z0) * fx;
        let c01 = v(x0, y0, z1) * (1.0 - fx) + v(x1, y0, z1) * fx;
        let c11 = v(x0, y1, z1) * (1.0 - fx) + v(x1, y1, z1) * fx;

        let c0 = c00 * (1.0 - fy) + c10 * fy;
        let c1 = c01 * (1.0 - fy) + c11 * fy;

        c0 * (1.0 - fz) + c1 * fz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Volume;

    #[test]
    fn test_linear_on_grid_points() {
        let v = Volume::from_fn([3, 3, 3], |x, y, z| (x + 10 * y + 100 * z) as f64);
        let interp = LinearInterpolator::new();
        assert_eq!(interp.sample(&v, [2.0, 1.0, 2.0]), 212.0);
        assert_eq!(interp.sample(&v, [0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_linear_reproduces_linear_field() {
        let v = Volume::from_fn([4, 4, 4], |x, y, z| (2 * x + 3 * y + 5 * z) as f32);
        let interp = LinearInterpolator::new();
        let value = interp.sample(&v, [1.25, 2.5, 0.75]);
        let expected = 2.0 * 1.25 + 3.0 * 2.5 + 5.0 * 0.75;
        assert!((value - expected).abs() < 1e-5);
    }

    #[test]
    fn test_linear_flat_axis() {
        let v = Volume::from_fn([3, 3, 1], |x, _, _| x as f64);
        let interp = LinearInterpolator::new();
        assert!((interp.sample(&v, [1.5, 1.0, 0.0]) - 1.5).abs() < 1e-12);
        assert_eq!(interp.sample(&v, [1.5, 1.0, 0.2]), 0.0);
    }

    #[test]
    fn test_linear_outside_is_zero() {
        let v = Volume::filled([2, 2, 2], 3.0f64);
        let interp = LinearInterpolator::new();
        assert_eq!(interp.sample(&v, [-0.1, 0.0, 0.0]), 0.0);
        assert_eq!(interp.sample(&v, [1.0, 1.0, 1.0]), 3.0);
    }
}
