//! Error types shared by the segmentation crates.
//!
//! The variants follow the failure taxonomy of the EM engine: structural
//! problems in the hierarchy, configuration problems, numerical failures
//! and mismatched inputs.

use thiserror::Error;

/// Main error type for segmentation operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SegmentationError {
    /// Tree validation failure (scalar types, boundaries, MRF tensor).
    #[error("Structural error: {0}")]
    StructuralError(String),

    /// Invalid or contradictory configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Numerical failure such as a singular affine matrix.
    #[error("Numerical failure: {0}")]
    NumericalFailure(String),

    /// Channel count, scalar type or spacing inconsistency across inputs.
    #[error("Input mismatch: {0}")]
    InputMismatch(String),

    /// Dimension mismatch.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Shape mismatch.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Operation that the caller asked for but which is not supported.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Result type for segmentation operations.
pub type Result<T> = std::result::Result<T, SegmentationError>;

impl SegmentationError {
    /// Create a structural error.
    pub fn structural(msg: impl Into<String>) -> Self {
        Self::StructuralError(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a numerical failure error.
    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::NumericalFailure(msg.into())
    }

    /// Create an input mismatch error.
    pub fn input_mismatch(msg: impl Into<String>) -> Self {
        Self::InputMismatch(msg.into())
    }

    /// Create a dimension mismatch error.
    pub fn dimension_mismatch(msg: impl Into<String>) -> Self {
        Self::DimensionMismatch(msg.into())
    }

    /// Create an unsupported operation error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Whether the error aborts the whole subtree it was raised in.
    ///
    /// Configuration problems are downgraded by the engine where a
    /// sensible fallback exists; every other kind is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidConfiguration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = SegmentationError::structural("bad tree");
        assert!(matches!(err, SegmentationError::StructuralError(_)));
    }

    #[test]
    fn test_error_display() {
        let err = SegmentationError::numerical("singular matrix");
        assert_eq!(err.to_string(), "Numerical failure: singular matrix");
    }

    #[test]
    fn test_shape_mismatch() {
        let err = SegmentationError::ShapeMismatch {
            expected: vec![4, 4, 4],
            actual: vec![4, 4, 2],
        };
        let err_str = err.to_string();
        assert!(err_str.contains("expected"));
        assert!(err_str.contains("got"));
    }

    #[test]
    fn test_fatality() {
        assert!(SegmentationError::structural("x").is_fatal());
        assert!(!SegmentationError::invalid_configuration("x").is_fatal());
    }
}
