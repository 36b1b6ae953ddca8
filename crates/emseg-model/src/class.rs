//! Leaf tissue classes.

use std::sync::Arc;

use emseg_core::{Result, ScalarVolume, SegmentationError};
use nalgebra::{DMatrix, DVector};

use crate::node::ChildRegistration;
use crate::shape::PcaShapeModel;

/// Terminal node: a Gaussian intensity model in log space plus a label.
#[derive(Debug, Clone)]
pub struct TissueClass {
    pub name: String,
    /// Output label, `-1` when the class is never written.
    pub label: i32,
    pub log_mean: Vec<f64>,
    pub log_covariance: DMatrix<f64>,
    pub prob_data_weight: f64,
    pub prob_data: Option<Arc<ScalarVolume>>,
    pub shape_model: Option<PcaShapeModel>,
    pub input_channel_weights: Vec<f64>,
    pub exclude_from_incomplete_e_step: bool,
    pub include_spatial_prior_for_normalization: bool,
    pub registration: ChildRegistration,
}

impl TissueClass {
    /// Class with zero log-mean and unit log-covariance over `channels`.
    pub fn new(name: impl Into<String>, label: i32, channels: usize) -> Self {
        Self {
            name: name.into(),
            label,
            log_mean: vec![0.0; channels],
            log_covariance: DMatrix::identity(channels, channels),
            prob_data_weight: 0.0,
            prob_data: None,
            shape_model: None,
            input_channel_weights: vec![1.0; channels],
            exclude_from_incomplete_e_step: false,
            include_spatial_prior_for_normalization: true,
            registration: ChildRegistration::default(),
        }
    }

    pub fn with_log_mean(mut self, log_mean: Vec<f64>) -> Self {
        self.log_mean = log_mean;
        self
    }

    pub fn with_log_covariance(mut self, log_covariance: DMatrix<f64>) -> Self {
        self.log_covariance = log_covariance;
        self
    }

    /// One-channel shortcut for mean and variance.
    pub fn with_log_gaussian(self, mean: f64, variance: f64) -> Self {
        self.with_log_mean(vec![mean])
            .with_log_covariance(DMatrix::from_element(1, 1, variance))
    }

    pub fn with_prob_data(mut self, prob_data: Arc<ScalarVolume>, weight: f64) -> Self {
        self.prob_data = Some(prob_data);
        self.prob_data_weight = weight;
        self
    }

    pub fn with_shape_model(mut self, model: PcaShapeModel, weight: f64) -> Self {
        self.shape_model = Some(model);
        self.prob_data_weight = weight;
        self
    }

    pub fn with_input_channel_weights(mut self, weights: Vec<f64>) -> Self {
        self.input_channel_weights = weights;
        self
    }

    pub fn with_exclude_from_incomplete_e_step(mut self, exclude: bool) -> Self {
        self.exclude_from_incomplete_e_step = exclude;
        self
    }

    pub fn with_include_spatial_prior_for_normalization(mut self, include: bool) -> Self {
        self.include_spatial_prior_for_normalization = include;
        self
    }

    pub fn with_registration(mut self, registration: ChildRegistration) -> Self {
        self.registration = registration;
        self
    }

    pub fn channel_count(&self) -> usize {
        self.log_mean.len()
    }

    /// Whether a probability map or a shape model provides a spatial prior.
    pub fn has_spatial_prior(&self) -> bool {
        self.prob_data.is_some() || self.shape_model.is_some()
    }

    pub fn pca_mode_count(&self) -> usize {
        self.shape_model.as_ref().map_or(0, PcaShapeModel::mode_count)
    }

    /// Precompute the density evaluator of this class.
    pub fn gaussian(&self) -> Result<GaussianModel> {
        GaussianModel::new(
            &self.log_mean,
            &self.log_covariance,
            &self.input_channel_weights,
        )
        .map_err(|e| {
            SegmentationError::numerical(format!("class '{}': {}", self.name, e))
        })
    }
}

/// Multivariate normal density with cached inverse and normaliser.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianModel {
    mean: DVector<f64>,
    inverse: DMatrix<f64>,
    channel_weights: DVector<f64>,
    norm: f64,
}

impl GaussianModel {
    pub fn new(mean: &[f64], covariance: &DMatrix<f64>, channel_weights: &[f64]) -> Result<Self> {
        let n = mean.len();
        if covariance.nrows() != n || covariance.ncols() != n || channel_weights.len() != n {
            return Err(SegmentationError::dimension_mismatch(format!(
                "mean has {} channels, covariance is {}x{}, {} channel weights",
                n,
                covariance.nrows(),
                covariance.ncols(),
                channel_weights.len()
            )));
        }
        let det = covariance.determinant();
        if !(det > 0.0) {
            return Err(SegmentationError::numerical(format!(
                "covariance is not positive definite (determinant {:e})",
                det
            )));
        }
        let inverse = covariance
            .clone()
            .try_inverse()
            .ok_or_else(|| SegmentationError::numerical("covariance inversion failed"))?;
        let norm = 1.0 / ((2.0 * std::f64::consts::PI).powi(n as i32) * det).sqrt();
        Ok(Self {
            mean: DVector::from_column_slice(mean),
            inverse,
            channel_weights: DVector::from_column_slice(channel_weights),
            norm,
        })
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn inverse_covariance(&self) -> &DMatrix<f64> {
        &self.inverse
    }

    /// Density at `x`. Each residual component is scaled by its channel
    /// weight, so a zero weight removes the channel from the exponent.
    #[inline]
    pub fn density(&self, x: &[f64]) -> f64 {
        let r = DVector::from_iterator(
            self.mean.len(),
            x.iter()
                .zip(self.mean.iter())
                .zip(self.channel_weights.iter())
                .map(|((xi, mi), wi)| (xi - mi) * wi),
        );
        let mahalanobis = (r.transpose() * &self.inverse * &r)[(0, 0)];
        self.norm * (-0.5 * mahalanobis).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let c = TissueClass::new("white matter", 3, 2);
        assert_eq!(c.channel_count(), 2);
        assert_eq!(c.input_channel_weights, vec![1.0, 1.0]);
        assert!(!c.has_spatial_prior());
        assert_eq!(c.pca_mode_count(), 0);
    }

    #[test]
    fn test_univariate_density() {
        let g = TissueClass::new("a", 1, 1)
            .with_log_gaussian(2.0, 0.25)
            .gaussian()
            .unwrap();
        let peak = 1.0 / (2.0 * std::f64::consts::PI * 0.25).sqrt();
        assert!((g.density(&[2.0]) - peak).abs() < 1e-12);
        assert!((g.density(&[2.5]) - peak * (-0.5f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_zero_channel_weight_ignores_channel() {
        let cov = DMatrix::identity(2, 2);
        let g = GaussianModel::new(&[0.0, 0.0], &cov, &[1.0, 0.0]).unwrap();
        assert!((g.density(&[0.0, 100.0]) - g.density(&[0.0, 0.0])).abs() < 1e-15);
    }

    #[test]
    fn test_singular_covariance() {
        let c = TissueClass::new("bad", 1, 2).with_log_covariance(DMatrix::zeros(2, 2));
        let err = c.gaussian().unwrap_err();
        assert!(matches!(err, SegmentationError::NumericalFailure(_)));
        assert!(err.to_string().contains("bad"));
    }
}
