//! Affine rotation + translation pairs.
//!
//! Transforms act on voxel coordinates centred on the image middle:
//! `T(p) = R (p - mid) + t + mid`, where `mid = (length - 1) / 2`.

use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SegmentationError};

/// Determinant magnitude below which a rotation block counts as singular.
pub const SINGULAR_DETERMINANT: f64 = 1e-8;

/// A 3×3 linear block plus translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineMatrix {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
}

impl AffineMatrix {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity(), Vector3::zeros())
    }

    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// `self ∘ inner`: rotation `A_R B_R`, translation `A_R B_t + A_t`.
    pub fn compose(&self, inner: &AffineMatrix) -> AffineMatrix {
        AffineMatrix {
            rotation: self.rotation * inner.rotation,
            translation: self.rotation * inner.translation + self.translation,
        }
    }

    pub fn determinant(&self) -> f64 {
        self.rotation.determinant()
    }

    /// Exact inverse `(R^-1, -R^-1 t)`.
    pub fn inverse(&self) -> Result<AffineMatrix> {
        let inv = invert_rotation(&self.rotation)?;
        Ok(AffineMatrix {
            rotation: inv,
            translation: -(inv * self.translation),
        })
    }

    /// Map a voxel coordinate through the transform, centred on `mid`.
    #[inline]
    pub fn map_centered(&self, p: [f64; 3], mid: [f64; 3]) -> [f64; 3] {
        let centred = Vector3::new(p[0] - mid[0], p[1] - mid[1], p[2] - mid[2]);
        let q = self.rotation * centred + self.translation;
        [q[0] + mid[0], q[1] + mid[1], q[2] + mid[2]]
    }

    /// 4×4 homogeneous matrix.
    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Whether all entries match `other` within `tol`.
    pub fn approx_eq(&self, other: &AffineMatrix, tol: f64) -> bool {
        (self.rotation - other.rotation).abs().max() <= tol
            && (self.translation - other.translation).abs().max() <= tol
    }
}

impl Default for AffineMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

/// Invert a 3×3 block, failing when `|det| <= SINGULAR_DETERMINANT`.
pub fn invert_rotation(m: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let det = m.determinant();
    if det.abs() <= SINGULAR_DETERMINANT {
        return Err(SegmentationError::numerical(format!(
            "matrix is (close to) singular, determinant {:e}",
            det
        )));
    }
    m.try_inverse().ok_or_else(|| {
        SegmentationError::numerical("matrix inversion failed".to_string())
    })
}
