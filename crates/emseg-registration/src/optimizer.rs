//! Derivative-free minimisation.
//!
//! The engine only relies on [`DirectionSetOptimizer`]; [`CoordinateSearch`]
//! is the bundled implementation, a compass search along the coordinate
//! axes with step halving.

use emseg_core::{Result, SegmentationError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cost::CostFunction;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Stop once the step length falls below this value.
    pub tolerance: f64,
    /// Hard cap on cost evaluations.
    pub max_evaluations: usize,
    /// First step length along every axis.
    pub initial_step: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-3,
            max_evaluations: 2000,
            initial_step: 1.0,
        }
    }
}

impl OptimizerConfig {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = max_evaluations;
        self
    }

    pub fn with_initial_step(mut self, initial_step: f64) -> Self {
        self.initial_step = initial_step;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance > 0.0) {
            return Err(SegmentationError::invalid_configuration(format!(
                "optimizer tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if !(self.initial_step > 0.0) {
            return Err(SegmentationError::invalid_configuration(format!(
                "optimizer initial step must be positive, got {}",
                self.initial_step
            )));
        }
        if self.max_evaluations == 0 {
            return Err(SegmentationError::invalid_configuration(
                "optimizer needs at least one evaluation",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub parameters: Vec<f64>,
    pub cost: f64,
    pub evaluations: usize,
    /// Whether the step length reached the tolerance before the
    /// evaluation cap.
    pub converged: bool,
}

/// A minimiser that only ever asks for cost values.
pub trait DirectionSetOptimizer {
    fn minimize(&self, cost: &mut dyn CostFunction, initial: &[f64]) -> Result<OptimizationResult>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinateSearch {
    config: OptimizerConfig,
}

impl CoordinateSearch {
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }
}

impl DirectionSetOptimizer for CoordinateSearch {
    fn minimize(&self, cost: &mut dyn CostFunction, initial: &[f64]) -> Result<OptimizationResult> {
        if initial.len() != cost.parameter_count() {
            return Err(SegmentationError::dimension_mismatch(format!(
                "optimizer started with {} parameters, cost takes {}",
                initial.len(),
                cost.parameter_count()
            )));
        }
        let mut x = initial.to_vec();
        let mut best = cost.evaluate(&x)?;
        let mut evaluations = 1;
        let mut step = self.config.initial_step;
        let budget = self.config.max_evaluations;

        'search: while step >= self.config.tolerance {
            let mut improved = false;
            for axis in 0..x.len() {
                for direction in [1.0, -1.0] {
                    if evaluations >= budget {
                        break 'search;
                    }
                    let previous = x[axis];
                    x[axis] = previous + direction * step;
                    let value = cost.evaluate(&x)?;
                    evaluations += 1;
                    if value < best {
                        best = value;
                        improved = true;
                        break;
                    }
                    x[axis] = previous;
                }
            }
            if !improved {
                step *= 0.5;
            }
        }

        let converged = step < self.config.tolerance;
        debug!(evaluations, cost = best, converged, "coordinate search finished");
        Ok(OptimizationResult {
            parameters: x,
            cost: best,
            evaluations,
            converged,
        })
    }
}
