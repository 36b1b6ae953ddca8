//! Engine configuration.

use emseg_core::{GaussianSmoother, Result, SegmentationError};
use emseg_registration::OptimizerConfig;
use serde::{Deserialize, Serialize};

/// Settings shared by every level of one segmentation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Weight of the MRF term, in `[0, 1]`.
    pub alpha: f64,
    /// Taps of the bias smoothing kernel (odd).
    pub smoothing_width: usize,
    /// Standard deviation of the bias smoothing kernel, in voxels.
    pub smoothing_sigma: f64,
    /// Worker threads; `None` uses the available hardware concurrency and
    /// `Some(1)` disables multithreading.
    pub number_of_threads: Option<usize>,
    /// Number of training samples `N` the probability maps were built from.
    pub number_of_training_samples: f64,
    /// Divisor of the translation and rotation terms of the 3-D
    /// class-specific registration prior.
    pub registration_penalty_divisor: f64,
    /// Re-estimate log-means and covariances after every E-step.
    pub reestimate_intensity: bool,
    /// Smallest variance kept on the covariance diagonal when
    /// re-estimating.
    pub variance_floor: f64,
    pub optimizer: OptimizerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            smoothing_width: 11,
            smoothing_sigma: 5.0,
            number_of_threads: None,
            number_of_training_samples: 1.0,
            registration_penalty_divisor: 1000.0,
            reestimate_intensity: false,
            variance_floor: 1e-4,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_smoothing(mut self, width: usize, sigma: f64) -> Self {
        self.smoothing_width = width;
        self.smoothing_sigma = sigma;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.number_of_threads = Some(threads);
        self
    }

    /// Run every kernel on a single worker.
    pub fn without_multithreading(self) -> Self {
        self.with_threads(1)
    }

    pub fn with_training_samples(mut self, samples: f64) -> Self {
        self.number_of_training_samples = samples;
        self
    }

    pub fn with_registration_penalty_divisor(mut self, divisor: f64) -> Self {
        self.registration_penalty_divisor = divisor;
        self
    }

    pub fn with_intensity_reestimation(mut self, variance_floor: f64) -> Self {
        self.reestimate_intensity = true;
        self.variance_floor = variance_floor;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Bias smoother described by this configuration.
    pub fn smoother(&self) -> Result<GaussianSmoother> {
        GaussianSmoother::new(self.smoothing_width, self.smoothing_sigma)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(SegmentationError::invalid_configuration(format!(
                "alpha must lie in [0, 1], got {}",
                self.alpha
            )));
        }
        if self.number_of_threads == Some(0) {
            return Err(SegmentationError::invalid_configuration(
                "number of threads must be at least 1",
            ));
        }
        if !(self.number_of_training_samples >= 1.0) {
            return Err(SegmentationError::invalid_configuration(format!(
                "number of training samples must be at least 1, got {}",
                self.number_of_training_samples
            )));
        }
        if !(self.registration_penalty_divisor > 0.0) {
            return Err(SegmentationError::invalid_configuration(format!(
                "registration penalty divisor must be positive, got {}",
                self.registration_penalty_divisor
            )));
        }
        if !(self.variance_floor > 0.0) {
            return Err(SegmentationError::invalid_configuration(format!(
                "variance floor must be positive, got {}",
                self.variance_floor
            )));
        }
        self.smoother()?;
        self.optimizer.validate()
    }
}
