//! Bias field estimation.
//!
//! For every voxel the weighted inverse covariances and residuals of all
//! leaves are accumulated, both fields are smoothed, and the bias is the
//! solution of the smoothed `C x C` system. The corrected intensity of the
//! next E-step is `y - b`.

use emseg_core::{GaussianSmoother, Result};
use emseg_model::VoxelStatus;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::input::PreparedInput;
use crate::level::LevelModel;

/// Re-estimate `bias` (one buffer per channel over the boundary) from the
/// current responsibilities. Voxels outside the ROI keep their value.
pub(crate) fn estimate_bias(
    model: &LevelModel,
    input: &PreparedInput,
    weights: &[Vec<f64>],
    status: &[VoxelStatus],
    smoother: &GaussianSmoother,
    pool: &ThreadPool,
    bias: &mut [Vec<f64>],
) -> Result<()> {
    let channels = input.channel_count();
    let count = input.voxel_count();
    let lengths = input.boundary.lengths();

    pool.install(|| -> Result<()> {
        let mut inverse: Vec<Vec<f64>> = (0..channels * channels)
            .into_par_iter()
            .map(|entry| {
                let (a, b) = (entry / channels, entry % channels);
                (0..count)
                    .map(|local| {
                        if !status[local].in_roi() {
                            return 0.0;
                        }
                        model
                            .leaves
                            .iter()
                            .zip(weights)
                            .map(|(leaf, w)| w[local] * leaf.gaussian.inverse_covariance()[(a, b)])
                            .sum()
                    })
                    .collect()
            })
            .collect();

        let mut residual: Vec<Vec<f64>> = (0..channels)
            .into_par_iter()
            .map(|a| {
                (0..count)
                    .map(|local| {
                        if !status[local].in_roi() {
                            return 0.0;
                        }
                        let mut r = 0.0;
                        for (leaf, w) in model.leaves.iter().zip(weights) {
                            let w = w[local];
                            if w == 0.0 {
                                continue;
                            }
                            let inv = leaf.gaussian.inverse_covariance();
                            let mean = leaf.gaussian.mean();
                            for d in 0..channels {
                                r += w * inv[(a, d)] * (input.log_intensity[d][local] - mean[d]);
                            }
                        }
                        r
                    })
                    .collect()
            })
            .collect();

        for field in inverse.iter_mut().chain(residual.iter_mut()) {
            smoother.smooth(field, lengths)?;
        }

        let solved: Vec<Vec<f64>> = (0..count)
            .into_par_iter()
            .map(|local| {
                let system = DMatrix::from_fn(channels, channels, |a, b| inverse[a * channels + b][local]);
                let rhs = DVector::from_fn(channels, |a, _| residual[a][local]);
                system
                    .lu()
                    .solve(&rhs)
                    .filter(|x| x.iter().all(|v| v.is_finite()))
                    .map_or_else(|| vec![0.0; channels], |x| x.iter().copied().collect())
            })
            .collect();

        for (local, values) in solved.into_iter().enumerate() {
            if !status[local].in_roi() {
                continue;
            }
            for (c, value) in values.into_iter().enumerate() {
                bias[c][local] = value;
            }
        }
        Ok(())
    })
}
