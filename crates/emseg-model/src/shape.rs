//! PCA statistical shape models.
//!
//! A shape model reconstructs a signed distance field as
//! `mean + Σ_k p_k · eigenvector_k` and maps it to a spatial prior in
//! `[0, N]` through a logistic transfer, `N` being the number of training
//! samples.

use std::sync::Arc;

use emseg_core::{Result, SegmentationError, Volume};
use serde::{Deserialize, Serialize};

/// How shape parameters are shared between the classes of one superclass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PcaShapeModelType {
    /// Every class owns its parameter vector.
    #[default]
    Independent,
    /// One parameter vector drives all classes.
    Dependent,
    /// Parameters are applied but never re-estimated.
    Apply,
}

/// Logistic map from a distance value to a spatial prior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticTransfer {
    pub slope: f64,
    pub boundary: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for LogisticTransfer {
    fn default() -> Self {
        Self {
            slope: 1.0,
            boundary: 0.0,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
        }
    }
}

impl LogisticTransfer {
    pub fn new(slope: f64, boundary: f64, min: f64, max: f64) -> Self {
        Self {
            slope,
            boundary,
            min,
            max,
        }
    }

    /// `N / (1 + exp(-slope (d - boundary)))`, clamped to `0` below `min`
    /// and to `N` above `max`.
    #[inline]
    pub fn apply(&self, distance: f64, training_samples: f64) -> f64 {
        if distance < self.min {
            return 0.0;
        }
        if distance > self.max {
            return training_samples;
        }
        training_samples / (1.0 + (-self.slope * (distance - self.boundary)).exp())
    }
}

/// Mean shape, ranked eigenvectors and eigenvalues of one class.
#[derive(Debug, Clone)]
pub struct PcaShapeModel {
    mean_shape: Arc<Volume<f32>>,
    eigenvectors: Vec<Arc<Volume<f32>>>,
    eigenvalues: Vec<f64>,
    transfer: LogisticTransfer,
    parameters: Vec<f64>,
}

impl PcaShapeModel {
    /// Build a model; all fields must share the mean shape's dimensions and
    /// every eigenvalue must be positive.
    pub fn new(
        mean_shape: Arc<Volume<f32>>,
        eigenvectors: Vec<Arc<Volume<f32>>>,
        eigenvalues: Vec<f64>,
        transfer: LogisticTransfer,
    ) -> Result<Self> {
        if eigenvectors.len() != eigenvalues.len() {
            return Err(SegmentationError::dimension_mismatch(format!(
                "{} eigenvectors but {} eigenvalues",
                eigenvectors.len(),
                eigenvalues.len()
            )));
        }
        let dims = mean_shape.dims();
        if let Some(bad) = eigenvectors.iter().position(|e| e.dims() != dims) {
            return Err(SegmentationError::ShapeMismatch {
                expected: dims.to_vec(),
                actual: eigenvectors[bad].dims().to_vec(),
            });
        }
        if let Some(bad) = eigenvalues.iter().find(|v| !(**v > 0.0)) {
            return Err(SegmentationError::numerical(format!(
                "eigenvalue {} is not positive",
                bad
            )));
        }
        let parameters = vec![0.0; eigenvalues.len()];
        Ok(Self {
            mean_shape,
            eigenvectors,
            eigenvalues,
            transfer,
            parameters,
        })
    }

    /// Initial shape parameters (zero by default).
    pub fn with_parameters(mut self, parameters: Vec<f64>) -> Result<Self> {
        if parameters.len() != self.mode_count() {
            return Err(SegmentationError::dimension_mismatch(format!(
                "{} shape parameters for {} modes",
                parameters.len(),
                self.mode_count()
            )));
        }
        self.parameters = parameters;
        Ok(self)
    }

    pub fn mode_count(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn dims(&self) -> [usize; 3] {
        self.mean_shape.dims()
    }

    pub fn mean_shape(&self) -> &Volume<f32> {
        &self.mean_shape
    }

    pub fn eigenvectors(&self) -> &[Arc<Volume<f32>>] {
        &self.eigenvectors
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    pub fn inverse_eigenvalues(&self) -> Vec<f64> {
        self.eigenvalues.iter().map(|v| 1.0 / v).collect()
    }

    pub fn transfer(&self) -> &LogisticTransfer {
        &self.transfer
    }

    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    pub fn set_parameters(&mut self, parameters: &[f64]) {
        let n = self.parameters.len().min(parameters.len());
        self.parameters[..n].copy_from_slice(&parameters[..n]);
    }

    /// Reconstructed distance at `pos` for the given coefficients.
    #[inline]
    pub fn distance_at(&self, pos: [usize; 3], parameters: &[f64]) -> f64 {
        let [x, y, z] = pos;
        let mut distance = self.mean_shape.get(x, y, z) as f64;
        for (p, e) in parameters.iter().zip(&self.eigenvectors) {
            distance += p * e.get(x, y, z) as f64;
        }
        distance
    }

    /// Spatial prior at `pos` for the given coefficients.
    #[inline]
    pub fn prior_at(&self, pos: [usize; 3], parameters: &[f64], training_samples: f64) -> f64 {
        self.transfer
            .apply(self.distance_at(pos, parameters), training_samples)
    }
}
