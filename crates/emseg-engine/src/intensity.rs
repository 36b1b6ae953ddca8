//! Optional re-estimation of the leaf intensity models.
//!
//! Only the level's copies of the leaves are updated; the caller's tree
//! keeps the configured models.

use emseg_core::{Result, SegmentationError};
use emseg_model::{GaussianModel, VoxelStatus};
use nalgebra::DMatrix;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::input::PreparedInput;
use crate::level::LevelModel;

/// Responsibility mass below which a leaf keeps its previous model.
const MIN_MASS: f64 = 1.0e-9;

/// Weighted mean and covariance of every leaf from the bias-corrected
/// intensities, with `variance_floor` on the diagonal.
pub(crate) fn reestimate_intensity(
    model: &mut LevelModel,
    input: &PreparedInput,
    bias: &[Vec<f64>],
    weights: &[Vec<f64>],
    status: &[VoxelStatus],
    variance_floor: f64,
    pool: &ThreadPool,
) -> Result<()> {
    let channels = input.channel_count();
    let count = input.voxel_count();
    let corrected: Vec<Vec<f64>> = (0..channels)
        .map(|c| (0..count).map(|i| input.log_intensity[c][i] - bias[c][i]).collect())
        .collect();

    pool.install(|| {
        model
            .leaves
            .par_iter_mut()
            .zip(weights)
            .try_for_each(|(leaf, w)| -> Result<()> {
                let mass: f64 = (0..count).filter(|&i| status[i].in_roi()).map(|i| w[i]).sum();
                if mass < MIN_MASS {
                    return Ok(());
                }
                let mean: Vec<f64> = (0..channels)
                    .map(|c| {
                        (0..count)
                            .filter(|&i| status[i].in_roi())
                            .map(|i| w[i] * corrected[c][i])
                            .sum::<f64>()
                            / mass
                    })
                    .collect();
                let mut covariance = DMatrix::from_fn(channels, channels, |a, b| {
                    (0..count)
                        .filter(|&i| status[i].in_roi())
                        .map(|i| w[i] * (corrected[a][i] - mean[a]) * (corrected[b][i] - mean[b]))
                        .sum::<f64>()
                        / mass
                });
                for d in 0..channels {
                    covariance[(d, d)] = covariance[(d, d)].max(variance_floor);
                }
                let gaussian = GaussianModel::new(&mean, &covariance, &leaf.channel_weights)
                    .map_err(|e| {
                        SegmentationError::numerical(format!(
                            "class '{}': re-estimated intensity model: {}",
                            leaf.name, e
                        ))
                    })?;
                leaf.log_mean = mean;
                leaf.log_covariance = covariance;
                leaf.gaussian = gaussian;
                Ok(())
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::SegmentationInput;
    use crate::level::LevelModel;
    use emseg_core::{build_worker_pool, ScalarVolume, Volume};
    use emseg_model::{RegistrationType, SuperClass, TissueClass};
    use std::sync::Arc;

    #[test]
    fn test_means_follow_the_responsibilities() {
        let head = SuperClass::new("root")
            .with_child(TissueClass::new("dark", 1, 1).with_log_gaussian(1.0, 1.0))
            .with_child(TissueClass::new("bright", 2, 1).with_log_gaussian(6.0, 1.0));
        let image = Volume::from_fn([4, 1, 1], |x, _, _| if x < 2 { 10.0f32 } else { 200.0 });
        let input = SegmentationInput::new(vec![Arc::new(ScalarVolume::from(image))]);
        let prepared = PreparedInput::prepare(&input, &head).unwrap();
        let mut model = LevelModel::build(&head, "1", RegistrationType::Disabled, false, 1.0, prepared.dims).unwrap();
        let weights = vec![vec![1.0, 1.0, 0.0, 0.0], vec![0.0, 0.0, 1.0, 1.0]];
        let status = vec![VoxelStatus::Regular; 4];
        let bias = vec![vec![0.0; 4]];
        let pool = build_worker_pool(Some(2)).unwrap();
        reestimate_intensity(&mut model, &prepared, &bias, &weights, &status, 1e-3, &pool).unwrap();

        assert!((model.leaves[0].log_mean[0] - 11f64.ln()).abs() < 1e-6);
        assert!((model.leaves[1].log_mean[0] - 201f64.ln()).abs() < 1e-6);
        // identical samples collapse onto the variance floor
        assert!((model.leaves[0].log_covariance[(0, 0)] - 1e-3).abs() < 1e-12);
        // the tree is untouched
        assert_eq!(head.leaves()[0].log_mean, vec![1.0]);
    }
}
