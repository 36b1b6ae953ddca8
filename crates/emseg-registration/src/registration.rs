//! Atlas-to-subject registration cost.
//!
//! The cost compares the current responsibilities with the atlas
//! probabilities warped by a candidate affine transform:
//!
//! ```text
//! C(p) = -( Σ_x [ Σ_c w(x,c) log P(T_p(x), c) - log Σ_c P(T_p(x), c) ] + G(p) )
//! ```
//!
//! where `G` is a Gaussian prior on the class-specific parameters. Parameter
//! vectors hold one set for the superclass (unless the mode is class-only)
//! followed by one set per class-specific child.

use std::sync::Arc;

use emseg_core::interpolation::InterpolationType;
use emseg_core::transform::{normalize_angle, parameters_to_inverse};
use emseg_core::volume::WalkedVoxel;
use emseg_core::{
    partition_box, AffineMatrix, BoxWalker, ParameterLayout, Result, ScalarVolume,
    SegmentationError, Volume, VoxelBox, WorkRange,
};
use emseg_model::{RegistrationType, VoxelStatus};
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, trace};

use crate::cost::CostFunction;

/// Cost returned for parameter sets whose scales leave the search box.
pub const MAX_PENALTY: f64 = 1.0e20;

/// Smallest admissible scale factor.
pub const MIN_SCALING: f64 = 0.70;
/// Largest admissible scale factor.
pub const MAX_SCALING: f64 = 1.22;

/// Probability substituted for an empty atlas entry.
const REGISTRATION_EPSILON: f64 = 0.05;

/// Per-voxel contributions above this are rounding noise.
const VOXEL_NOISE: f64 = -1.0e-4;

/// `1000 / (2 * 600000)`, applied to the class-specific Gaussian prior.
const CLASS_PRIOR_SCALE: f64 = 1000.0 / (2.0 * 600_000.0);

/// Weight of the z-scale prior under global-only registration.
const GLOBAL_Z_SCALE_PRIOR: f64 = 1000.0 * 1000.0 / 2.0;

/// One leaf below a registered child.
#[derive(Debug, Clone)]
pub struct RegistrationLeaf {
    /// Responsibilities over the segmentation boundary, x fastest.
    pub weights: Arc<[f64]>,
    /// Atlas probabilities; leaves without one do not take part.
    pub prob_data: Option<Arc<ScalarVolume>>,
}

/// One immediate child of the registered superclass.
#[derive(Debug, Clone)]
pub struct RegistrationChild {
    pub leaves: Vec<RegistrationLeaf>,
    /// Owns a parameter set under class-specific registration.
    pub class_specific: bool,
    /// Diagonal inverse covariance of the child's parameters (full order).
    pub inv_covariance: [f64; 9],
    /// Leaves contribute individually instead of as one summed class.
    pub independent_sub_classes: bool,
}

/// Everything the registration cost reads.
#[derive(Debug, Clone)]
pub struct RegistrationProblem {
    pub registration_type: RegistrationType,
    pub layout: ParameterLayout,
    pub interpolation: InterpolationType,
    pub generate_background: bool,
    pub training_samples: f64,
    /// Divisor of the translation/rotation terms of the 3-D class prior.
    pub penalty_divisor: f64,
    /// Full image dimensions; atlases share them.
    pub image_dims: [usize; 3],
    /// Segmentation boundary in absolute 0-based coordinates.
    pub boundary: VoxelBox,
    /// Box of voxels carrying weight, relative to the boundary.
    pub weight_roi: Option<VoxelBox>,
    /// Voxel status over the boundary.
    pub status: Arc<[VoxelStatus]>,
    pub children: Vec<RegistrationChild>,
    /// Dominant child per voxel over the boundary, `-1` when none dominates.
    pub weight_map: Option<Arc<[i32]>>,
    /// Dominant child per atlas voxel, `-1` when none dominates.
    pub prob_data_map: Option<Arc<Volume<i32>>>,
    pub global_to_atlas: AffineMatrix,
    /// Fixed superclass-to-global transform used under class-only
    /// registration.
    pub superclass_to_global: AffineMatrix,
}

struct AtlasTransforms {
    superclass: AffineMatrix,
    children: Vec<AffineMatrix>,
}

#[derive(Default)]
struct PartialSum {
    sum: f64,
    spatial: Vec<(usize, f64)>,
}

/// Registration cost over one superclass.
pub struct RegistrationCostFunction {
    problem: RegistrationProblem,
    pool: Arc<ThreadPool>,
    mid: [f64; 3],
    roi: VoxelBox,
    roi_voxel_count: usize,
    parameter_sets: usize,
    spatial_cost: Option<Vec<f64>>,
    min_weight_atlas_cost: f64,
    min_gaussian_cost: f64,
}

impl RegistrationCostFunction {
    pub fn new(problem: RegistrationProblem, pool: Arc<ThreadPool>) -> Result<Self> {
        let kind = problem.registration_type;
        if !kind.estimates() {
            return Err(SegmentationError::invalid_configuration(format!(
                "registration type {:?} does not estimate parameters",
                kind
            )));
        }
        if kind == RegistrationType::Sequential {
            return Err(SegmentationError::invalid_configuration(
                "sequential registration is not supported",
            ));
        }
        if problem.children.is_empty() {
            return Err(SegmentationError::invalid_configuration(
                "registration needs at least one child",
            ));
        }
        if problem.generate_background && problem.children.len() < 2 {
            return Err(SegmentationError::invalid_configuration(
                "a generated background needs at least one sibling",
            ));
        }
        let boundary_voxels = problem.boundary.voxel_count();
        if problem.status.len() != boundary_voxels {
            return Err(SegmentationError::ShapeMismatch {
                expected: vec![boundary_voxels],
                actual: vec![problem.status.len()],
            });
        }
        for leaf in problem.children.iter().flat_map(|c| &c.leaves) {
            if leaf.weights.len() != boundary_voxels {
                return Err(SegmentationError::ShapeMismatch {
                    expected: vec![boundary_voxels],
                    actual: vec![leaf.weights.len()],
                });
            }
            if let Some(map) = &leaf.prob_data {
                if map.dims() != problem.image_dims {
                    return Err(SegmentationError::ShapeMismatch {
                        expected: problem.image_dims.to_vec(),
                        actual: map.dims().to_vec(),
                    });
                }
            }
        }
        if let Some(map) = &problem.weight_map {
            if map.len() != boundary_voxels {
                return Err(SegmentationError::ShapeMismatch {
                    expected: vec![boundary_voxels],
                    actual: vec![map.len()],
                });
            }
        }
        if let Some(roi) = &problem.weight_roi {
            let lengths = problem.boundary.lengths();
            if (0..3).any(|a| roi.max()[a] >= lengths[a]) {
                return Err(SegmentationError::dimension_mismatch(format!(
                    "weight ROI {:?}..{:?} exceeds the boundary lengths {:?}",
                    roi.min(),
                    roi.max(),
                    lengths
                )));
            }
        }
        if !(problem.penalty_divisor > 0.0) {
            return Err(SegmentationError::invalid_configuration(format!(
                "registration penalty divisor must be positive, got {}",
                problem.penalty_divisor
            )));
        }

        let mut parameter_sets = usize::from(kind != RegistrationType::ClassOnly);
        if kind.is_class_specific() {
            parameter_sets += problem
                .children
                .iter()
                .skip(usize::from(problem.generate_background))
                .filter(|c| c.class_specific)
                .count();
        }
        if parameter_sets == 0 {
            return Err(SegmentationError::invalid_configuration(
                "class-only registration without class-specific children",
            ));
        }

        let dims = problem.image_dims;
        let mid = [
            (dims[0] as f64 - 1.0) * 0.5,
            (dims[1] as f64 - 1.0) * 0.5,
            (dims[2] as f64 - 1.0) * 0.5,
        ];
        let roi_voxel_count = problem.status.iter().filter(|s| s.in_roi()).count();
        let mut cost = Self {
            roi: problem.boundary,
            problem,
            pool,
            mid,
            roi_voxel_count,
            parameter_sets,
            spatial_cost: None,
            min_weight_atlas_cost: f64::INFINITY,
            min_gaussian_cost: 0.0,
        };
        cost.initialize();
        Ok(cost)
    }

    /// Reset the minimum-cost tracking and place the weight ROI in absolute
    /// image coordinates.
    pub fn initialize(&mut self) {
        self.min_weight_atlas_cost = f64::INFINITY;
        self.min_gaussian_cost = 0.0;
        self.roi = match self.problem.weight_roi {
            Some(relative) => relative.offset_by(self.problem.boundary.min()),
            None => self.problem.boundary,
        };
        debug!(
            registration_type = ?self.problem.registration_type,
            roi_min = ?self.roi.min(),
            roi_max = ?self.roi.max(),
            "registration cost initialised"
        );
    }

    /// Normalise every rotation angle of `parameters` into `(-180, 180]`.
    pub fn finalize(&self, parameters: &mut [f64]) {
        let layout = self.problem.layout;
        for set in parameters.chunks_mut(layout.per_set()) {
            for i in layout.rotation_indices() {
                if let Some(angle) = set.get_mut(i) {
                    *angle = normalize_angle(*angle);
                }
            }
        }
    }

    /// Record the per-voxel contribution of every evaluation.
    pub fn spatial_cost_on(&mut self) {
        self.spatial_cost = Some(vec![0.0; self.problem.boundary.voxel_count()]);
    }

    pub fn spatial_cost_off(&mut self) {
        self.spatial_cost = None;
    }

    /// Per-voxel cost of the last evaluation over the boundary.
    pub fn spatial_cost(&self) -> Option<&[f64]> {
        self.spatial_cost.as_deref()
    }

    pub fn parameter_sets(&self) -> usize {
        self.parameter_sets
    }

    pub fn layout(&self) -> ParameterLayout {
        self.problem.layout
    }

    pub fn roi(&self) -> VoxelBox {
        self.roi
    }

    /// Weighted-atlas term of the best evaluation so far.
    pub fn min_weight_atlas_cost(&self) -> f64 {
        self.min_weight_atlas_cost
    }

    /// Gaussian term of the best evaluation so far.
    pub fn min_gaussian_cost(&self) -> f64 {
        self.min_gaussian_cost
    }

    pub fn min_cost(&self) -> f64 {
        self.min_weight_atlas_cost + self.min_gaussian_cost
    }

    fn scales_out_of_bounds(&self, parameters: &[f64]) -> bool {
        let layout = self.problem.layout;
        parameters.chunks(layout.per_set()).any(|set| {
            layout
                .scale_indices()
                .any(|i| set[i] < MIN_SCALING || set[i] > MAX_SCALING)
        })
    }

    fn inverse_set(&self, set: &[f64]) -> Result<AffineMatrix> {
        let full = self.problem.layout.expand(set)?;
        parameters_to_inverse(&full)
    }

    fn atlas_transforms(&self, parameters: &[f64]) -> Result<AtlasTransforms> {
        let kind = self.problem.registration_type;
        let per_set = self.problem.layout.per_set();
        let mut index = 0;
        let superclass = if kind != RegistrationType::ClassOnly {
            let to_global = self.inverse_set(&parameters[..per_set])?;
            index += per_set;
            self.problem.global_to_atlas.compose(&to_global)
        } else {
            self.problem
                .global_to_atlas
                .compose(&self.problem.superclass_to_global)
        };

        let mut children = vec![superclass; self.problem.children.len()];
        if kind != RegistrationType::GlobalOnly {
            let start = usize::from(self.problem.generate_background);
            for (h, child) in self.problem.children.iter().enumerate().skip(start) {
                if child.class_specific {
                    let to_superclass = self.inverse_set(&parameters[index..index + per_set])?;
                    children[h] = superclass.compose(&to_superclass);
                    index += per_set;
                }
            }
        }
        Ok(AtlasTransforms {
            superclass,
            children,
        })
    }

    fn sum_range(
        &self,
        active: VoxelBox,
        range: WorkRange,
        transforms: &AtlasTransforms,
    ) -> PartialSum {
        let record = self.spatial_cost.is_some();
        let mut partial = PartialSum::default();
        for WalkedVoxel { pos, .. } in BoxWalker::new(active, range) {
            let local = self.problem.boundary.local_index(pos);
            if self.problem.status[local].skips_registration() {
                continue;
            }
            if let Some(value) = self.voxel_cost(pos, local, transforms) {
                partial.sum += value;
                if record {
                    partial.spatial.push((local, -value));
                }
            }
        }
        partial
    }

    fn voxel_cost(&self, pos: [usize; 3], local: usize, transforms: &AtlasTransforms) -> Option<f64> {
        let problem = &self.problem;
        let p = [pos[0] as f64, pos[1] as f64, pos[2] as f64];
        let global_only = problem.registration_type == RegistrationType::GlobalOnly;
        let global_target = transforms.superclass.map_centered(p, self.mid);

        if global_only {
            if let (Some(atlas_map), Some(weight_map)) = (&problem.prob_data_map, &problem.weight_map) {
                let dominant = InterpolationType::Nearest.sample(&**atlas_map, global_target);
                if dominant >= 0.0 && dominant == f64::from(weight_map[local]) {
                    return None;
                }
            }
        }

        let ln_epsilon = REGISTRATION_EPSILON.ln();
        let safe_ln = |v: f64| if v > 0.0 { v.ln() } else { ln_epsilon };
        let mut sum_all = 0.0;
        let mut numerator = 0.0;
        let mut count = 0usize;

        for (h, child) in problem.children.iter().enumerate().rev() {
            let mut class_prob = 0.0;
            let mut class_weight = 0.0;
            let independent = child.independent_sub_classes;

            if h == 0 && problem.generate_background {
                class_prob = (problem.training_samples - sum_all).max(0.0);
                for leaf in child.leaves.iter().rev() {
                    let w = leaf.weights[local];
                    if w != 0.0 {
                        if independent {
                            numerator += w * safe_ln(class_prob);
                            count += 1;
                        } else {
                            class_weight += w;
                        }
                    }
                }
            } else {
                let target = if global_only {
                    global_target
                } else {
                    transforms.children[h].map_centered(p, self.mid)
                };
                for leaf in child.leaves.iter().rev() {
                    let Some(atlas) = &leaf.prob_data else {
                        continue;
                    };
                    let prob = problem.interpolation.sample(&**atlas, target);
                    class_prob += prob;
                    let w = leaf.weights[local];
                    if w != 0.0 {
                        if independent {
                            numerator += w * safe_ln(prob);
                            count += 1;
                        } else {
                            class_weight += w;
                        }
                    }
                }
            }

            sum_all += class_prob;
            if !independent && class_weight != 0.0 {
                numerator += class_weight * safe_ln(class_prob);
                count += 1;
            }
        }

        if count == 0 {
            return None;
        }
        if sum_all == 0.0 {
            sum_all = count as f64 * REGISTRATION_EPSILON;
        }
        let value = numerator - sum_all.ln();
        (value < VOXEL_NOISE).then_some(value)
    }

    /// Log of the Gaussian prior on the parameters (non-positive).
    fn gaussian_penalty(&self, parameters: &[f64]) -> f64 {
        let problem = &self.problem;
        let layout = problem.layout;
        let per_set = layout.per_set();
        let kind = problem.registration_type;

        if kind.is_class_specific() {
            let mut index = if kind > RegistrationType::ClassOnly { per_set } else { 0 };
            let mut penalty = 0.0;
            let start = usize::from(problem.generate_background);
            for child in problem.children.iter().skip(start) {
                if !child.class_specific {
                    continue;
                }
                let p = &parameters[index..index + per_set];
                let ic = &child.inv_covariance;
                if layout.two_d {
                    penalty -= ic[0] * p[0] * p[0] + ic[1] * p[1] * p[1] + ic[5] * p[2] * p[2];
                    if !layout.rigid {
                        penalty -= ic[6] * (p[3] - 1.0).powi(2) + ic[7] * (p[4] - 1.0).powi(2);
                    }
                } else {
                    for i in 0..6 {
                        penalty -= ic[i] * p[i] * p[i] / problem.penalty_divisor;
                    }
                    if !layout.rigid {
                        for i in 6..9 {
                            penalty -= ic[i] * (p[i] - 1.0).powi(2);
                        }
                    }
                }
                index += per_set;
            }
            penalty * self.roi_voxel_count as f64 * CLASS_PRIOR_SCALE
        } else if !layout.two_d && !layout.rigid {
            -(parameters[8] - 1.0).powi(2) * GLOBAL_Z_SCALE_PRIOR
        } else {
            0.0
        }
    }
}

impl CostFunction for RegistrationCostFunction {
    fn parameter_count(&self) -> usize {
        self.parameter_sets * self.problem.layout.per_set()
    }

    fn evaluate(&mut self, parameters: &[f64]) -> Result<f64> {
        if parameters.len() != self.parameter_count() {
            return Err(SegmentationError::dimension_mismatch(format!(
                "registration cost takes {} parameters, got {}",
                self.parameter_count(),
                parameters.len()
            )));
        }
        if self.scales_out_of_bounds(parameters) {
            return Ok(MAX_PENALTY);
        }

        let transforms = self.atlas_transforms(parameters)?;
        let active = self.roi;
        let ranges = partition_box(&active, self.pool.current_num_threads());
        let partials: Vec<PartialSum> = {
            let this = &*self;
            this.pool.install(|| {
                ranges
                    .par_iter()
                    .map(|range| this.sum_range(active, *range, &transforms))
                    .collect()
            })
        };

        if let Some(buffer) = self.spatial_cost.as_mut() {
            buffer.fill(0.0);
        }
        let mut result = 0.0;
        for partial in partials {
            result += partial.sum;
            if let Some(buffer) = self.spatial_cost.as_mut() {
                for (index, value) in partial.spatial {
                    buffer[index] = value;
                }
            }
        }

        let penalty = self.gaussian_penalty(parameters);
        let cost = -(result + penalty);
        if cost < self.min_cost() {
            self.min_weight_atlas_cost = -result;
            self.min_gaussian_cost = -penalty;
        }
        trace!(cost, atlas = -result, gaussian = -penalty, "registration cost");
        Ok(cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emseg_core::build_worker_pool;

    fn problem(kind: RegistrationType) -> RegistrationProblem {
        let dims = [4, 4, 1];
        let boundary = VoxelBox::full(dims);
        let n = boundary.voxel_count();
        let atlas = Arc::new(ScalarVolume::from(Volume::filled(dims, 1.0f32)));
        let leaf = |w: f64| RegistrationLeaf {
            weights: vec![w; n].into(),
            prob_data: Some(atlas.clone()),
        };
        let child = |w: f64, specific: bool| RegistrationChild {
            leaves: vec![leaf(w)],
            class_specific: specific,
            inv_covariance: [1.0; 9],
            independent_sub_classes: false,
        };
        RegistrationProblem {
            registration_type: kind,
            layout: ParameterLayout::new(true, false),
            interpolation: InterpolationType::Linear,
            generate_background: false,
            training_samples: 1.0,
            penalty_divisor: 1000.0,
            image_dims: dims,
            boundary,
            weight_roi: None,
            status: vec![VoxelStatus::Regular; n].into(),
            children: vec![child(0.5, true), child(0.5, true), child(0.0, false)],
            weight_map: None,
            prob_data_map: None,
            global_to_atlas: AffineMatrix::identity(),
            superclass_to_global: AffineMatrix::identity(),
        }
    }

    fn cost(kind: RegistrationType) -> RegistrationCostFunction {
        RegistrationCostFunction::new(problem(kind), build_worker_pool(Some(2)).unwrap()).unwrap()
    }

    #[test]
    fn test_parameter_count() {
        assert_eq!(cost(RegistrationType::GlobalOnly).parameter_count(), 5);
        assert_eq!(cost(RegistrationType::ClassOnly).parameter_count(), 10);
        assert_eq!(cost(RegistrationType::Simultaneous).parameter_count(), 15);
    }

    #[test]
    fn test_rejects_non_estimating_types() {
        let pool = build_worker_pool(Some(1)).unwrap();
        for kind in [RegistrationType::Disabled, RegistrationType::ApplyOnly, RegistrationType::Sequential] {
            let err = RegistrationCostFunction::new(problem(kind), pool.clone()).err();
            assert!(matches!(err, Some(SegmentationError::InvalidConfiguration(_))));
        }
    }

    #[test]
    fn test_scale_out_of_bounds() {
        let mut cost = cost(RegistrationType::GlobalOnly);
        assert_eq!(cost.evaluate(&[0.0, 0.0, 0.0, 0.5, 1.0]).unwrap(), MAX_PENALTY);
        assert_eq!(cost.evaluate(&[0.0, 0.0, 0.0, 1.0, 1.3]).unwrap(), MAX_PENALTY);
        assert!(cost.evaluate(&[0.0, 0.0, 0.0, 1.0, 1.0]).unwrap() < MAX_PENALTY);
    }

    #[test]
    fn test_wrong_length() {
        let mut cost = cost(RegistrationType::GlobalOnly);
        assert!(cost.evaluate(&[0.0; 3]).is_err());
    }

    #[test]
    fn test_uniform_atlas_cost() {
        // three classes with prob 1, two of them weighted 0.5: 0.5 ln 1 + 0.5 ln 1 - ln 3
        let mut cost = cost(RegistrationType::GlobalOnly);
        let value = cost.evaluate(&[0.0, 0.0, 0.0, 1.0, 1.0]).unwrap();
        let expected = 16.0 * 3f64.ln();
        assert!((value - expected).abs() < 1e-9, "{} vs {}", value, expected);
        assert!((cost.min_weight_atlas_cost() - expected).abs() < 1e-9);
        assert_eq!(cost.min_gaussian_cost(), 0.0);
    }

    #[test]
    fn test_class_prior_penalises_deviation() {
        let mut cost = cost(RegistrationType::ClassOnly);
        let identity = [0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0];
        let at_identity = cost.evaluate(&identity).unwrap();
        let mut moved = identity;
        moved[2] = 3.0;
        let rotated = cost.evaluate(&moved).unwrap();
        assert!(rotated > at_identity);
        // the best evaluation stays recorded
        assert!((cost.min_cost() - at_identity).abs() < 1e-9);
    }

    #[test]
    fn test_finalize_normalises_rotation() {
        let cost = cost(RegistrationType::GlobalOnly);
        let mut parameters = [1.0, 2.0, 270.0, 1.0, 1.0];
        cost.finalize(&mut parameters);
        assert_eq!(parameters, [1.0, 2.0, -90.0, 1.0, 1.0]);
    }

    #[test]
    fn test_spatial_cost_buffer() {
        let mut cost = cost(RegistrationType::GlobalOnly);
        cost.spatial_cost_on();
        cost.evaluate(&[0.0, 0.0, 0.0, 1.0, 1.0]).unwrap();
        let buffer = cost.spatial_cost().unwrap();
        assert!(buffer.iter().all(|v| (v - 3f64.ln()).abs() < 1e-9));
    }

    #[test]
    fn test_excluded_voxels_skipped() {
        let mut p = problem(RegistrationType::GlobalOnly);
        let mut status = vec![VoxelStatus::Regular; 16];
        status[..8].fill(VoxelStatus::IncompleteModel);
        p.status = status.into();
        let mut cost = RegistrationCostFunction::new(p, build_worker_pool(Some(3)).unwrap()).unwrap();
        let value = cost.evaluate(&[0.0, 0.0, 0.0, 1.0, 1.0]).unwrap();
        assert!((value - 8.0 * 3f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_agreeing_dominant_labels_are_skipped_off_grid() {
        // label maps are read at the closest voxel, never blended
        let mut p = problem(RegistrationType::GlobalOnly);
        let label = |x: usize| i32::from(x >= 2);
        p.prob_data_map = Some(Arc::new(Volume::from_fn([4, 4, 1], move |x, _, _| label(x))));
        p.weight_map = Some((0..16).map(|i| label(i % 4)).collect::<Vec<_>>().into());
        let mut skipped = RegistrationCostFunction::new(p, build_worker_pool(Some(2)).unwrap()).unwrap();
        assert_eq!(skipped.evaluate(&[0.25, 0.0, 0.0, 1.0, 1.0]).unwrap(), 0.0);

        let mut unskipped = cost(RegistrationType::GlobalOnly);
        assert!(unskipped.evaluate(&[0.25, 0.0, 0.0, 1.0, 1.0]).unwrap() > 1.0);
    }
}
