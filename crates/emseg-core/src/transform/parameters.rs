//! Registration parameter vectors.
//!
//! A full parameter set is `(tx, ty, tz, rx, ry, rz, sx, sy, sz)` with
//! rotations in degrees. The linear block is `Rz * Ry * Rx * S`. Rigid and
//! 2-D registrations optimise a reduced vector that expands to the full set.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use super::affine::{invert_rotation, AffineMatrix};
use crate::error::{Result, SegmentationError};

/// Number of entries of a full parameter set.
pub const FULL_PARAMETER_COUNT: usize = 9;

/// Shape of one parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParameterLayout {
    /// Registration in the x/y plane only.
    pub two_d: bool,
    /// Translation and rotation only.
    pub rigid: bool,
}

impl ParameterLayout {
    pub fn new(two_d: bool, rigid: bool) -> Self {
        Self { two_d, rigid }
    }

    /// Parameters per set: 3 (2-D rigid), 5 (2-D), 6 (3-D rigid) or 9.
    pub fn per_set(&self) -> usize {
        match (self.two_d, self.rigid) {
            (true, true) => 3,
            (true, false) => 5,
            (false, true) => 6,
            (false, false) => 9,
        }
    }

    /// Indices of the rotation entries within one set.
    pub fn rotation_indices(&self) -> Range<usize> {
        if self.two_d {
            2..3
        } else {
            3..6
        }
    }

    /// Indices of the scale entries within one set (empty when rigid).
    pub fn scale_indices(&self) -> Range<usize> {
        match (self.two_d, self.rigid) {
            (_, true) => 0..0,
            (true, false) => 3..5,
            (false, false) => 6..9,
        }
    }

    /// Identity parameter set: zero translation/rotation, unit scale.
    pub fn identity_set(&self) -> Vec<f64> {
        let mut set = vec![0.0; self.per_set()];
        for i in self.scale_indices() {
            set[i] = 1.0;
        }
        set
    }

    /// Expand a reduced set to `(tx, ty, tz, rx, ry, rz, sx, sy, sz)`.
    pub fn expand(&self, set: &[f64]) -> Result<[f64; FULL_PARAMETER_COUNT]> {
        if set.len() != self.per_set() {
            return Err(SegmentationError::dimension_mismatch(format!(
                "parameter set has {} entries, expected {}",
                set.len(),
                self.per_set()
            )));
        }
        let full = match (self.two_d, self.rigid) {
            (true, true) => [set[0], set[1], 0.0, 0.0, 0.0, set[2], 1.0, 1.0, 1.0],
            (true, false) => [set[0], set[1], 0.0, 0.0, 0.0, set[2], set[3], set[4], 1.0],
            (false, true) => [set[0], set[1], set[2], set[3], set[4], set[5], 1.0, 1.0, 1.0],
            (false, false) => [
                set[0], set[1], set[2], set[3], set[4], set[5], set[6], set[7], set[8],
            ],
        };
        Ok(full)
    }

    /// Reduce a full set to this layout (inverse of [`expand`](Self::expand)).
    pub fn reduce(&self, full: &[f64; FULL_PARAMETER_COUNT]) -> Vec<f64> {
        match (self.two_d, self.rigid) {
            (true, true) => vec![full[0], full[1], full[5]],
            (true, false) => vec![full[0], full[1], full[5], full[6], full[7]],
            (false, true) => full[..6].to_vec(),
            (false, false) => full.to_vec(),
        }
    }
}

fn rotation_x(deg: f64) -> Matrix3<f64> {
    let (s, c) = deg.to_radians().sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c)
}

fn rotation_y(deg: f64) -> Matrix3<f64> {
    let (s, c) = deg.to_radians().sin_cos();
    Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c)
}

fn rotation_z(deg: f64) -> Matrix3<f64> {
    let (s, c) = deg.to_radians().sin_cos();
    Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
}

/// Forward transform of a full parameter set: `(Rz Ry Rx S, t)`.
pub fn parameters_to_matrix(p: &[f64; FULL_PARAMETER_COUNT]) -> AffineMatrix {
    let scale = Matrix3::from_diagonal(&Vector3::new(p[6], p[7], p[8]));
    let linear = rotation_z(p[5]) * rotation_y(p[4]) * rotation_x(p[3]) * scale;
    AffineMatrix::new(linear, Vector3::new(p[0], p[1], p[2]))
}

/// Inverse pair of a full parameter set: `(R^-1, -t)`.
///
/// This is the structure-to-atlas direction used by the registration cost
/// function; the translation is negated, not back-rotated.
pub fn parameters_to_inverse(p: &[f64; FULL_PARAMETER_COUNT]) -> Result<AffineMatrix> {
    let forward = parameters_to_matrix(p);
    let inv = invert_rotation(forward.rotation()).map_err(|_| {
        SegmentationError::numerical(format!(
            "could not invert the affine matrix of parameters {:?}",
            p
        ))
    })?;
    Ok(AffineMatrix::new(inv, -*forward.translation()))
}

/// Normalise an angle in degrees into `(-180, 180]`.
pub fn normalize_angle(deg: f64) -> f64 {
    let mut a = deg % 360.0;
    if a <= -180.0 {
        a += 360.0;
    } else if a > 180.0 {
        a -= 360.0;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_set() {
        assert_eq!(ParameterLayout::new(true, true).per_set(), 3);
        assert_eq!(ParameterLayout::new(true, false).per_set(), 5);
        assert_eq!(ParameterLayout::new(false, true).per_set(), 6);
        assert_eq!(ParameterLayout::new(false, false).per_set(), 9);
    }

    #[test]
    fn test_expand_2d() {
        let layout = ParameterLayout::new(true, false);
        let full = layout.expand(&[1.0, 2.0, 30.0, 0.9, 1.1]).unwrap();
        assert_eq!(full, [1.0, 2.0, 0.0, 0.0, 0.0, 30.0, 0.9, 1.1, 1.0]);
        assert_eq!(layout.reduce(&full), vec![1.0, 2.0, 30.0, 0.9, 1.1]);
        assert!(layout.expand(&[1.0]).is_err());
    }

    #[test]
    fn test_identity_parameters() {
        let layout = ParameterLayout::default();
        let id = layout.identity_set();
        assert_eq!(id, vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let full = layout.expand(&id).unwrap();
        let m = parameters_to_matrix(&full);
        assert!(m.approx_eq(&AffineMatrix::identity(), 1e-12));
        let inv = parameters_to_inverse(&full).unwrap();
        assert!(inv.approx_eq(&AffineMatrix::identity(), 1e-12));
    }

    #[test]
    fn test_rotation_order() {
        // 90 degrees about z maps x onto y
        let m = parameters_to_matrix(&[0.0, 0.0, 0.0, 0.0, 0.0, 90.0, 1.0, 1.0, 1.0]);
        let v = m.rotation() * Vector3::new(1.0, 0.0, 0.0);
        assert!((v[1] - 1.0).abs() < 1e-12);
        // scale is applied before rotation
        let m = parameters_to_matrix(&[0.0, 0.0, 0.0, 0.0, 0.0, 90.0, 2.0, 1.0, 1.0]);
        let v = m.rotation() * Vector3::new(1.0, 0.0, 0.0);
        assert!((v[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_scale_is_singular() {
        let err = parameters_to_inverse(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]).unwrap_err();
        assert!(matches!(err, SegmentationError::NumericalFailure(_)));
    }

    #[test]
    fn test_normalize_angle() {
        assert_eq!(normalize_angle(190.0), -170.0);
        assert_eq!(normalize_angle(-180.0), 180.0);
        assert_eq!(normalize_angle(180.0), 180.0);
        assert_eq!(normalize_angle(720.0 + 45.0), 45.0);
    }
}
