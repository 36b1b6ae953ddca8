//! Expectation step.
//!
//! Each worker walks one [`WorkRange`] of the boundary box and writes the
//! normalised responsibilities of every leaf into a private chunk; the
//! chunks are scattered back into the per-leaf buffers afterwards.

use emseg_core::volume::WalkedVoxel;
use emseg_core::{partition_box, BoxWalker, VoxelBox, WorkRange};
use emseg_model::{Direction, VoxelStatus};
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::input::PreparedInput;
use crate::level::{LevelModel, LevelTransforms};

/// Read-only state shared by every E-step worker.
pub(crate) struct EStepContext<'a> {
    pub model: &'a LevelModel,
    pub input: &'a PreparedInput,
    pub bias: &'a [Vec<f64>],
    pub transforms: Option<&'a LevelTransforms>,
    pub alpha: f64,
}

struct Chunk {
    range: WorkRange,
    /// Voxel-major: `leaf_count` weights per voxel.
    weights: Vec<f64>,
    status: Vec<VoxelStatus>,
}

/// Recompute `weights` (one buffer per leaf) and the in-ROI part of
/// `status`. Returns the number of voxels without a usable spatial prior.
pub(crate) fn e_step(
    ctx: &EStepContext<'_>,
    weights: &mut [Vec<f64>],
    status: &mut [VoxelStatus],
    pool: &ThreadPool,
) -> usize {
    let boundary = ctx.input.boundary;
    let neighbours = ctx.model.child_weights(weights);
    let ranges = partition_box(&boundary, pool.current_num_threads());
    let frozen: &[VoxelStatus] = status;
    let chunks: Vec<Chunk> = pool.install(|| {
        ranges
            .into_par_iter()
            .map(|range| e_step_range(ctx, range, &neighbours, frozen))
            .collect()
    });

    let leaves = ctx.model.leaf_count();
    let mut incomplete = 0;
    for chunk in chunks {
        for offset in 0..chunk.range.len {
            let local = chunk.range.first + offset;
            for (k, buffer) in weights.iter_mut().enumerate() {
                buffer[local] = chunk.weights[offset * leaves + k];
            }
            if chunk.status[offset] == VoxelStatus::IncompleteModel {
                incomplete += 1;
            }
            status[local] = chunk.status[offset];
        }
    }
    incomplete
}

fn e_step_range(
    ctx: &EStepContext<'_>,
    range: WorkRange,
    neighbours: &[Vec<f64>],
    status: &[VoxelStatus],
) -> Chunk {
    let model = ctx.model;
    let leaves = model.leaf_count();
    let mut chunk = Chunk {
        range,
        weights: vec![0.0; range.len * leaves],
        status: Vec::with_capacity(range.len),
    };
    let mut intensity = vec![0.0; ctx.input.channel_count()];
    let mut values = vec![0.0; leaves];
    let mut priors = vec![0.0; leaves];
    let mut gauss = vec![0.0; leaves];
    let mut mrf = vec![0.0; model.child_count()];

    for (offset, WalkedVoxel { pos, local }) in BoxWalker::new(ctx.input.boundary, range).enumerate() {
        let out = &mut chunk.weights[offset * leaves..(offset + 1) * leaves];
        if !status[local].in_roi() {
            chunk.status.push(VoxelStatus::OutsideRoi);
            continue;
        }
        ctx.input.corrected(local, ctx.bias, &mut intensity);
        model.source_values(pos, ctx.transforms, &mut values);
        let prior_sum = model.spatial_priors(&values, &mut priors);
        for (g, leaf) in gauss.iter_mut().zip(&model.leaves) {
            *g = leaf.gaussian.density(&intensity);
        }
        mrf_factors(model, ctx.alpha, &ctx.input.boundary, pos, neighbours, status, &mut mrf);

        if prior_sum > 0.0 {
            let mut total = 0.0;
            for (k, leaf) in model.leaves.iter().enumerate() {
                out[k] = priors[k] * gauss[k] * mrf[leaf.child];
                total += out[k];
            }
            if total > 0.0 && total.is_finite() {
                out.iter_mut().for_each(|w| *w /= total);
            } else {
                // every likelihood underflowed; fall back on the prior
                for (w, p) in out.iter_mut().zip(&priors) {
                    *w = p / prior_sum;
                }
            }
            chunk.status.push(VoxelStatus::Regular);
        } else {
            incomplete_model(model, &gauss, &mrf, out);
            chunk.status.push(VoxelStatus::IncompleteModel);
        }
    }
    chunk
}

/// Responsibilities where no leaf has a spatial prior: intensity and MRF
/// only, over the leaves not excluded from this case.
fn incomplete_model(model: &LevelModel, gauss: &[f64], mrf: &[f64], out: &mut [f64]) {
    let mut total = 0.0;
    for (k, leaf) in model.leaves.iter().enumerate() {
        out[k] = if leaf.exclude_from_incomplete {
            0.0
        } else {
            gauss[k] * mrf[leaf.child]
        };
        total += out[k];
    }
    if total > 0.0 && total.is_finite() {
        out.iter_mut().for_each(|w| *w /= total);
        return;
    }
    let eligible = model
        .leaves
        .iter()
        .filter(|leaf| !leaf.exclude_from_incomplete)
        .count();
    for (w, leaf) in out.iter_mut().zip(&model.leaves) {
        *w = if eligible == 0 {
            1.0 / model.leaves.len() as f64
        } else if leaf.exclude_from_incomplete {
            0.0
        } else {
            1.0 / eligible as f64
        };
    }
}

/// Neighbourhood factor of every child at `pos`:
/// `(1 - α) + α · exp(Σ_d Σ_j M[d][i][j] · w_j(pos + d))`.
///
/// A neighbour outside the boundary or the region of interest is replaced
/// by the voxel's own weights.
pub(crate) fn mrf_factors(
    model: &LevelModel,
    alpha: f64,
    boundary: &VoxelBox,
    pos: [usize; 3],
    neighbours: &[Vec<f64>],
    status: &[VoxelStatus],
    out: &mut [f64],
) {
    if alpha == 0.0 {
        out.fill(1.0);
        return;
    }
    out.fill(0.0);
    let own = boundary.local_index(pos);
    for direction in Direction::ALL {
        let step = direction.step();
        let mut at = [0usize; 3];
        let mut inside = true;
        for axis in 0..3 {
            let p = pos[axis] as i64 + step[axis];
            if p < boundary.min()[axis] as i64 || p > boundary.max()[axis] as i64 {
                inside = false;
                break;
            }
            at[axis] = p as usize;
        }
        let local = if inside {
            let local = boundary.local_index(at);
            if status[local].in_roi() {
                local
            } else {
                own
            }
        } else {
            own
        };
        for (i, energy) in out.iter_mut().enumerate() {
            *energy += neighbours
                .iter()
                .enumerate()
                .map(|(j, w)| model.markov.get(direction, i, j) * w[local])
                .sum::<f64>();
        }
    }
    for factor in out.iter_mut() {
        *factor = (1.0 - alpha) + alpha * factor.exp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::SegmentationInput;
    use emseg_core::{build_worker_pool, ScalarVolume, Volume};
    use emseg_model::{MarkovTensor, RegistrationType, SuperClass, TissueClass};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn two_class(markov: MarkovTensor) -> SuperClass {
        SuperClass::new("root")
            .with_child(TissueClass::new("dark", 1, 1).with_log_gaussian(11f64.ln(), 0.1))
            .with_child(TissueClass::new("bright", 2, 1).with_log_gaussian(201f64.ln(), 0.1))
            .with_markov(markov)
    }

    fn run(head: &SuperClass, image: Volume<f32>, alpha: f64, threads: usize) -> (Vec<Vec<f64>>, Vec<VoxelStatus>, usize) {
        let input = SegmentationInput::new(vec![Arc::new(ScalarVolume::from(image))]);
        let prepared = PreparedInput::prepare(&input, head).unwrap();
        let model = LevelModel::build(head, "1", RegistrationType::Disabled, false, 1.0, prepared.dims).unwrap();
        let count = prepared.voxel_count();
        let bias = vec![vec![0.0; count]];
        let ctx = EStepContext {
            model: &model,
            input: &prepared,
            bias: &bias,
            transforms: None,
            alpha,
        };
        let mut weights = vec![vec![0.5; count]; 2];
        let mut status = vec![VoxelStatus::Regular; count];
        let pool = build_worker_pool(Some(threads)).unwrap();
        let incomplete = e_step(&ctx, &mut weights, &mut status, &pool);
        (weights, status, incomplete)
    }

    #[test]
    fn test_intensity_separates_classes() {
        let image = Volume::from_fn([4, 4, 4], |x, _, _| if x < 2 { 10.0f32 } else { 200.0 });
        let (weights, status, incomplete) = run(&two_class(MarkovTensor::new(2)), image, 0.0, 3);
        assert_eq!(incomplete, 0);
        assert!(status.iter().all(|&s| s == VoxelStatus::Regular));
        for local in 0..64 {
            let x = local % 4;
            let (dark, bright) = (weights[0][local], weights[1][local]);
            assert!((dark + bright - 1.0).abs() < 1e-12);
            if x < 2 {
                assert!(dark > 0.99);
            } else {
                assert!(bright > 0.99);
            }
        }
    }

    #[test]
    fn test_missing_priors_mark_incomplete_model() {
        let zero = Arc::new(ScalarVolume::from(Volume::filled([2, 2, 1], 0.0f32)));
        let head = SuperClass::new("root")
            .with_child(
                TissueClass::new("a", 1, 1)
                    .with_log_gaussian(0.0, 1.0)
                    .with_prob_data(zero.clone(), 1.0),
            )
            .with_child(
                TissueClass::new("b", 2, 1)
                    .with_log_gaussian(0.0, 1.0)
                    .with_prob_data(zero, 1.0)
                    .with_exclude_from_incomplete_e_step(true),
            );
        let (weights, status, incomplete) = run(&head, Volume::filled([2, 2, 1], 0.0f32), 0.0, 1);
        assert_eq!(incomplete, 4);
        assert!(status.iter().all(|&s| s == VoxelStatus::IncompleteModel));
        assert!(weights[0].iter().all(|&w| (w - 1.0).abs() < 1e-12));
        assert!(weights[1].iter().all(|&w| w == 0.0));
    }

    fn mrf_model(dims: [usize; 3]) -> (LevelModel, VoxelBox) {
        let head = two_class(MarkovTensor::homogeneous(2, 1.0, 0.0));
        let input = SegmentationInput::new(vec![Arc::new(ScalarVolume::from(Volume::filled(dims, 1.0f32)))]);
        let prepared = PreparedInput::prepare(&input, &head).unwrap();
        let model = LevelModel::build(&head, "1", RegistrationType::Disabled, false, 1.0, prepared.dims).unwrap();
        (model, prepared.boundary)
    }

    #[test]
    fn test_mrf_energy_is_exponential_in_neighbour_agreement() {
        let (model, boundary) = mrf_model([3, 3, 3]);
        // every voxel fully "dark"
        let neighbours = vec![vec![1.0; 27], vec![0.0; 27]];
        let status = vec![VoxelStatus::Regular; 27];
        let mut factors = vec![0.0; 2];
        mrf_factors(&model, 0.7, &boundary, [1, 1, 1], &neighbours, &status, &mut factors);
        let expected = 0.3 + 0.7 * 6f64.exp();
        assert!((factors[0] - expected).abs() < 1e-9, "{:?}", factors);
        assert!((factors[0] - 282.70).abs() < 0.01);
        assert!((factors[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_mrf_uses_own_weight_for_missing_neighbours() {
        let (model, boundary) = mrf_model([3, 1, 1]);
        let neighbours = vec![vec![1.0, 0.2, 0.0], vec![0.0, 0.8, 1.0]];
        let status = [VoxelStatus::Regular, VoxelStatus::Regular, VoxelStatus::OutsideRoi];
        let mut factors = vec![0.0; 2];
        mrf_factors(&model, 1.0, &boundary, [1, 0, 0], &neighbours, &status, &mut factors);
        // west neighbour is (1.0, 0.0); east is outside the ROI and the four
        // off-axis neighbours leave the boundary, so five times (0.2, 0.8)
        let dark = (1.0 + 5.0 * 0.2f64).exp();
        let bright = (5.0 * 0.8f64).exp();
        assert!((factors[0] - dark).abs() < 1e-9);
        assert!((factors[1] - bright).abs() < 1e-9);

        mrf_factors(&model, 0.0, &boundary, [1, 0, 0], &neighbours, &status, &mut factors);
        assert_eq!(factors, vec![1.0, 1.0]);
    }

    #[test]
    fn test_outside_roi_stays_zero() {
        let head = two_class(MarkovTensor::new(2));
        let input = SegmentationInput::new(vec![Arc::new(ScalarVolume::from(Volume::filled([2, 1, 1], 10.0f32)))]);
        let prepared = PreparedInput::prepare(&input, &head).unwrap();
        let model = LevelModel::build(&head, "1", RegistrationType::Disabled, false, 1.0, prepared.dims).unwrap();
        let bias = vec![vec![0.0; 2]];
        let ctx = EStepContext {
            model: &model,
            input: &prepared,
            bias: &bias,
            transforms: None,
            alpha: 0.7,
        };
        let mut weights = vec![vec![0.0; 2]; 2];
        let mut status = vec![VoxelStatus::OutsideRoi, VoxelStatus::Regular];
        let pool = build_worker_pool(Some(2)).unwrap();
        e_step(&ctx, &mut weights, &mut status, &pool);
        assert_eq!((weights[0][0], weights[1][0]), (0.0, 0.0));
        assert_eq!(status[0], VoxelStatus::OutsideRoi);
        assert!((weights[0][1] + weights[1][1] - 1.0).abs() < 1e-12);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn responsibilities_sum_to_one(
            values in proptest::collection::vec(0.0f32..500.0, 27),
            alpha in 0.0f64..1.0,
            threads in 1usize..4,
        ) {
            let image = Volume::from_vec([3, 3, 3], values).unwrap();
            let (weights, _, _) = run(&two_class(MarkovTensor::homogeneous(2, 0.9, 0.1)), image, alpha, threads);
            for local in 0..27 {
                let sum = weights[0][local] + weights[1][local];
                prop_assert!((sum - 1.0).abs() < 1e-9);
            }
        }
    }
}
