//! Single-function view of the cost functions for the optimizer.

use emseg_core::{Result, SegmentationError};

use crate::cost::CostFunction;
use crate::registration::RegistrationCostFunction;
use crate::shape::ShapeCostFunction;

/// Exposes exactly one attached cost function as a derivative-free scalar
/// function of a flat parameter vector.
#[derive(Default)]
pub struct OptimizerAdapter<'a> {
    registration: Option<&'a mut RegistrationCostFunction>,
    shape: Option<&'a mut ShapeCostFunction>,
}

impl<'a> OptimizerAdapter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registration(mut self, cost: &'a mut RegistrationCostFunction) -> Self {
        self.registration = Some(cost);
        self
    }

    pub fn with_shape(mut self, cost: &'a mut ShapeCostFunction) -> Self {
        self.shape = Some(cost);
        self
    }

    fn attached(&mut self) -> Result<&mut dyn CostFunction> {
        match (self.registration.as_deref_mut(), self.shape.as_deref_mut()) {
            (Some(cost), None) => Ok(cost),
            (None, Some(cost)) => Ok(cost),
            (Some(_), Some(_)) => Err(SegmentationError::invalid_configuration(
                "both a registration and a shape cost function are attached",
            )),
            (None, None) => Err(SegmentationError::invalid_configuration(
                "no cost function is attached",
            )),
        }
    }

    /// Number of parameters of the attached function.
    pub fn dimension(&mut self) -> Result<usize> {
        Ok(self.attached()?.parameter_count())
    }

    pub fn cost(&mut self, parameters: &[f64]) -> Result<f64> {
        self.attached()?.evaluate(parameters)
    }

    /// Gradients are not available; the optimizer must be derivative-free.
    pub fn derivative(&self, _parameters: &[f64]) -> Result<Vec<f64>> {
        Err(SegmentationError::unsupported(
            "cost derivatives are not available",
        ))
    }
}

impl CostFunction for OptimizerAdapter<'_> {
    /// Zero when the adapter is misconfigured; [`OptimizerAdapter::dimension`]
    /// reports the error.
    fn parameter_count(&self) -> usize {
        match (&self.registration, &self.shape) {
            (Some(cost), None) => cost.parameter_count(),
            (None, Some(cost)) => cost.parameter_count(),
            _ => 0,
        }
    }

    fn evaluate(&mut self, parameters: &[f64]) -> Result<f64> {
        self.cost(parameters)
    }
}
