//! PCA shape cost.
//!
//! Shape parameters reconstruct a distance field per class, which the
//! logistic transfer turns into a spatial prior. The cost is
//!
//! ```text
//! C(s) = -Σ_x [ Σ_c w(x,c) log P_s(x,c) - log Σ_c P_s(x,c) ]
//!        + |ROI| · 0.0025 · Σ_k s_k² / λ_k
//! ```

use std::sync::Arc;

use emseg_core::transform::AffineMatrix;
use emseg_core::volume::WalkedVoxel;
use emseg_core::{
    partition_box, BoxWalker, Result, ScalarVolume, SegmentationError, VoxelBox, WorkRange,
};
use emseg_model::{PcaShapeModel, PcaShapeModelType, RegistrationType, VoxelStatus};
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::trace;

use crate::cost::CostFunction;

/// Prior substituted when a reconstructed prior is zero.
const SHAPE_EPSILON: f64 = 1.0e-5;

/// Per-voxel penalties below this magnitude are rounding noise.
const VOXEL_NOISE: f64 = 1.0e-4;

/// Scale of the eigenvalue prior per ROI voxel.
const GAUSSIAN_SCALE: f64 = 0.0025;

#[derive(Debug, Clone)]
pub struct ShapeLeaf {
    /// Responsibilities over the segmentation boundary, x fastest.
    pub weights: Arc<[f64]>,
    pub shape_model: Option<PcaShapeModel>,
    /// Used when the leaf has no shape model.
    pub prob_data: Option<Arc<ScalarVolume>>,
    pub include_spatial_prior_for_normalization: bool,
}

#[derive(Debug, Clone)]
pub struct ShapeChild {
    pub leaves: Vec<ShapeLeaf>,
    /// Image-to-atlas transform of this child.
    pub to_atlas: AffineMatrix,
}

#[derive(Debug, Clone)]
pub struct ShapeProblem {
    pub model_type: PcaShapeModelType,
    /// Decides how voxels are looked up in atlas space.
    pub registration_type: RegistrationType,
    pub training_samples: f64,
    pub image_dims: [usize; 3],
    /// Segmentation boundary in absolute 0-based coordinates.
    pub boundary: VoxelBox,
    /// Sub-box of the boundary holding every voxel the shape models touch.
    pub pca_box: VoxelBox,
    /// Voxel status over the boundary.
    pub status: Arc<[VoxelStatus]>,
    pub children: Vec<ShapeChild>,
    /// Image-to-atlas transform of the superclass.
    pub superclass_to_atlas: AffineMatrix,
}

#[derive(Default)]
struct PartialSum {
    sum: f64,
    spatial: Vec<(usize, f64)>,
}

/// Shape cost over one superclass.
pub struct ShapeCostFunction {
    problem: ShapeProblem,
    pool: Arc<ThreadPool>,
    mid: [f64; 3],
    /// Offset of every leaf's coefficients in the flat parameter vector.
    offsets: Vec<usize>,
    parameter_count: usize,
    roi_voxel_count: usize,
    spatial_cost: Option<Vec<f64>>,
    image_penalty: f64,
    gaussian_penalty: f64,
}

impl ShapeCostFunction {
    pub fn new(problem: ShapeProblem, pool: Arc<ThreadPool>) -> Result<Self> {
        let boundary = problem.boundary;
        let boundary_voxels = boundary.voxel_count();
        if problem.status.len() != boundary_voxels {
            return Err(SegmentationError::ShapeMismatch {
                expected: vec![boundary_voxels],
                actual: vec![problem.status.len()],
            });
        }
        if boundary.intersect(&problem.pca_box) != Some(problem.pca_box) {
            return Err(SegmentationError::dimension_mismatch(format!(
                "PCA box {:?}..{:?} leaves the boundary {:?}..{:?}",
                problem.pca_box.min(),
                problem.pca_box.max(),
                boundary.min(),
                boundary.max()
            )));
        }
        for leaf in problem.children.iter().flat_map(|c| &c.leaves) {
            if leaf.weights.len() != boundary_voxels {
                return Err(SegmentationError::ShapeMismatch {
                    expected: vec![boundary_voxels],
                    actual: vec![leaf.weights.len()],
                });
            }
            if let Some(model) = &leaf.shape_model {
                if model.dims() != problem.image_dims {
                    return Err(SegmentationError::ShapeMismatch {
                        expected: problem.image_dims.to_vec(),
                        actual: model.dims().to_vec(),
                    });
                }
            }
        }

        let mut offsets = Vec::new();
        let mut parameter_count = 0;
        for leaf in problem.children.iter().flat_map(|c| &c.leaves) {
            let modes = leaf.shape_model.as_ref().map_or(0, PcaShapeModel::mode_count);
            if problem.model_type == PcaShapeModelType::Dependent {
                offsets.push(0);
                parameter_count = parameter_count.max(modes);
            } else {
                offsets.push(parameter_count);
                parameter_count += modes;
            }
        }

        let dims = problem.image_dims;
        let mid = [
            (dims[0] as f64 - 1.0) * 0.5,
            (dims[1] as f64 - 1.0) * 0.5,
            (dims[2] as f64 - 1.0) * 0.5,
        ];
        let roi_voxel_count = BoxWalker::full(problem.pca_box)
            .filter(|v| problem.status[boundary.local_index(v.pos)].in_roi())
            .count();

        Ok(Self {
            problem,
            pool,
            mid,
            offsets,
            parameter_count,
            roi_voxel_count,
            spatial_cost: None,
            image_penalty: 0.0,
            gaussian_penalty: 0.0,
        })
    }

    /// Flatten the stored coefficients of every shape model, leaf by leaf.
    /// Under the class-dependent model every leaf writes the shared vector.
    pub fn parameters_to_array(&self) -> Vec<f64> {
        let mut array = vec![0.0; self.parameter_count];
        for (leaf, &offset) in self.leaves().zip(&self.offsets) {
            if let Some(model) = &leaf.shape_model {
                let params = model.parameters();
                array[offset..offset + params.len()].copy_from_slice(params);
            }
        }
        array
    }

    /// Split a flat vector into per-leaf coefficients (empty for leaves
    /// without a shape model).
    pub fn array_to_parameters(&self, array: &[f64]) -> Result<Vec<Vec<f64>>> {
        if array.len() != self.parameter_count {
            return Err(SegmentationError::dimension_mismatch(format!(
                "shape cost takes {} parameters, got {}",
                self.parameter_count,
                array.len()
            )));
        }
        Ok(self
            .leaves()
            .zip(&self.offsets)
            .map(|(leaf, &offset)| {
                let modes = leaf.shape_model.as_ref().map_or(0, PcaShapeModel::mode_count);
                array[offset..offset + modes].to_vec()
            })
            .collect())
    }

    /// Spatial prior of leaf `leaf_index` at atlas voxel `pos`.
    pub fn leaf_prior(&self, leaf_index: usize, pos: [usize; 3], array: &[f64]) -> Option<f64> {
        let leaf = self.leaves().nth(leaf_index)?;
        let offset = self.offsets[leaf_index];
        let model = leaf.shape_model.as_ref()?;
        let params = &array[offset..offset + model.mode_count()];
        Some(model.prior_at(pos, params, self.problem.training_samples))
    }

    pub fn spatial_cost_on(&mut self) {
        self.spatial_cost = Some(vec![0.0; self.problem.boundary.voxel_count()]);
    }

    pub fn spatial_cost_off(&mut self) {
        self.spatial_cost = None;
    }

    pub fn spatial_cost(&self) -> Option<&[f64]> {
        self.spatial_cost.as_deref()
    }

    /// Image term of the last evaluation.
    pub fn image_penalty(&self) -> f64 {
        self.image_penalty
    }

    /// Eigenvalue prior of the last evaluation.
    pub fn gaussian_penalty(&self) -> f64 {
        self.gaussian_penalty
    }

    pub fn roi_voxel_count(&self) -> usize {
        self.roi_voxel_count
    }

    fn leaves(&self) -> impl Iterator<Item = &ShapeLeaf> {
        self.problem.children.iter().flat_map(|c| c.leaves.iter())
    }

    fn atlas_position(&self, pos: [usize; 3], transform: &AffineMatrix) -> Option<[usize; 3]> {
        let p = [pos[0] as f64, pos[1] as f64, pos[2] as f64];
        let target = transform.map_centered(p, self.mid);
        let dims = self.problem.image_dims;
        let mut out = [0usize; 3];
        for axis in 0..3 {
            let rounded = (target[axis] + 0.5).floor();
            if rounded < 0.0 || rounded >= dims[axis] as f64 {
                return None;
            }
            out[axis] = rounded as usize;
        }
        Some(out)
    }

    fn sum_range(&self, range: WorkRange, array: &[f64]) -> PartialSum {
        let problem = &self.problem;
        let record = self.spatial_cost.is_some();
        let kind = problem.registration_type;
        let registered = kind != RegistrationType::Disabled;
        let global_only = kind == RegistrationType::GlobalOnly;
        let ln_epsilon = SHAPE_EPSILON.ln();
        let mut partial = PartialSum::default();

        for WalkedVoxel { pos, .. } in BoxWalker::new(problem.pca_box, range) {
            let local = problem.boundary.local_index(pos);
            if !problem.status[local].in_roi() {
                continue;
            }
            let global_position = if global_only {
                self.atlas_position(pos, &problem.superclass_to_atlas)
            } else {
                Some(pos)
            };

            let mut numerator = 0.0;
            let mut denominator = 0.0;
            let mut leaf_index = 0;
            for child in &problem.children {
                let position = if registered && !global_only {
                    self.atlas_position(pos, &child.to_atlas)
                } else {
                    global_position
                };
                for leaf in &child.leaves {
                    let offset = self.offsets[leaf_index];
                    leaf_index += 1;
                    let w = leaf.weights[local];
                    if let Some(model) = &leaf.shape_model {
                        let prior = position.map_or(0.0, |at| {
                            let params = &array[offset..offset + model.mode_count()];
                            model.prior_at(at, params, problem.training_samples)
                        });
                        if w > 0.0 {
                            numerator += w * if prior > 0.0 { prior.ln() } else { ln_epsilon };
                        }
                        denominator += prior;
                    } else if let Some(map) = &leaf.prob_data {
                        let prior = position.map_or(0.0, |[x, y, z]| map.get(x, y, z));
                        if prior > 0.0 {
                            if w > 0.0 {
                                numerator += w * prior.ln();
                            }
                            if leaf.include_spatial_prior_for_normalization {
                                denominator += prior;
                            }
                        }
                    }
                }
            }

            if denominator > 0.0 {
                let penalty = numerator - denominator.ln();
                if penalty.abs() > VOXEL_NOISE {
                    partial.sum += penalty;
                    if record {
                        partial.spatial.push((local, -penalty));
                    }
                }
            }
        }
        partial
    }

    /// `Σ_k b_k² / λ_k` over the parameter vector. Dependent leaves share
    /// one coefficient vector, so the eigenvalues come from the leaf with
    /// the most modes.
    fn eigenvalue_prior(&self, array: &[f64]) -> f64 {
        let models = self
            .leaves()
            .zip(&self.offsets)
            .filter_map(|(leaf, &offset)| leaf.shape_model.as_ref().map(|m| (m, offset)));
        let penalty = |(model, offset): (&PcaShapeModel, usize)| -> f64 {
            model
                .inverse_eigenvalues()
                .into_iter()
                .enumerate()
                .map(|(k, inv)| array[offset + k] * array[offset + k] * inv)
                .sum()
        };
        let penalty = if self.problem.model_type == PcaShapeModelType::Dependent {
            models
                .fold(None, |best: Option<(&PcaShapeModel, usize)>, next| match best {
                    Some(best) if best.0.mode_count() >= next.0.mode_count() => Some(best),
                    _ => Some(next),
                })
                .map_or(0.0, penalty)
        } else {
            models.map(penalty).sum()
        };
        self.roi_voxel_count as f64 * GAUSSIAN_SCALE * penalty
    }
}

impl CostFunction for ShapeCostFunction {
    fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    fn evaluate(&mut self, parameters: &[f64]) -> Result<f64> {
        if parameters.len() != self.parameter_count {
            return Err(SegmentationError::dimension_mismatch(format!(
                "shape cost takes {} parameters, got {}",
                self.parameter_count,
                parameters.len()
            )));
        }
        let ranges = partition_box(&self.problem.pca_box, self.pool.current_num_threads());
        let partials: Vec<PartialSum> = {
            let this = &*self;
            this.pool.install(|| {
                ranges
                    .par_iter()
                    .map(|range| this.sum_range(*range, parameters))
                    .collect()
            })
        };

        if let Some(buffer) = self.spatial_cost.as_mut() {
            buffer.fill(0.0);
        }
        let mut image = 0.0;
        for partial in partials {
            image += partial.sum;
            if let Some(buffer) = self.spatial_cost.as_mut() {
                for (index, value) in partial.spatial {
                    buffer[index] = value;
                }
            }
        }

        self.image_penalty = -image;
        self.gaussian_penalty = self.eigenvalue_prior(parameters);
        let cost = self.image_penalty + self.gaussian_penalty;
        trace!(
            cost,
            image = self.image_penalty,
            gaussian = self.gaussian_penalty,
            "shape cost"
        );
        Ok(cost)
    }
}
