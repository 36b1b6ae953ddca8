//! Affine transforms between subject and atlas space.

pub mod affine;
pub mod parameters;

pub use affine::{invert_rotation, AffineMatrix, SINGULAR_DETERMINANT};
pub use parameters::{
    normalize_angle, parameters_to_inverse, parameters_to_matrix, ParameterLayout,
    FULL_PARAMETER_COUNT,
};
