//! Image filters used by the bias-field estimation.

pub mod gaussian;

pub use gaussian::GaussianSmoother;
