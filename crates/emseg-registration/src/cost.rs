//! Scalar cost functions driven by a derivative-free optimizer.

use emseg_core::Result;

/// A scalar function of a flat parameter vector.
///
/// `evaluate` takes `&mut self` because implementations keep scratch state
/// (minimum-cost tracking, per-voxel cost buffers); the value itself depends
/// only on the parameters and the state fixed at construction.
pub trait CostFunction {
    /// Length of the parameter vector.
    fn parameter_count(&self) -> usize;

    /// Cost at `parameters`. Lower is better.
    fn evaluate(&mut self, parameters: &[f64]) -> Result<f64>;
}
