//! Per-level view of a superclass.
//!
//! A level segments the immediate children of one superclass. Its leaves
//! are every tissue class reachable from those children, in depth-first
//! order, each tagged with the child it belongs to.

use std::ops::Range;
use std::sync::Arc;

use emseg_core::interpolation::InterpolationType;
use emseg_core::transform::parameters_to_inverse;
use emseg_core::{AffineMatrix, Result, ScalarVolume, SegmentationError};
use emseg_model::{
    GaussianModel, HierarchyNode, MarkovTensor, PcaShapeModel, PcaShapeModelType,
    RegistrationType, StoppingCriteria, SuperClass, TissueClass,
};
use nalgebra::DMatrix;

/// Where a leaf's spatial prior comes from. Values are in `[0, N]`.
#[derive(Debug, Clone)]
pub(crate) enum PriorSource {
    /// Flat prior only.
    None,
    /// Probability map; `share` of its value belongs to this leaf. A map
    /// shared by the leaves of a superclass is `counted` once when the
    /// background probability is derived.
    Map {
        map: Arc<ScalarVolume>,
        share: f64,
        counted: bool,
    },
    Shape(PcaShapeModel),
    /// `max(0, N - Σ other sources)`.
    Background,
}

impl PriorSource {
    pub fn is_defined(&self) -> bool {
        !matches!(self, PriorSource::None)
    }

    fn of_class(class: &TissueClass) -> Self {
        if let Some(model) = &class.shape_model {
            PriorSource::Shape(model.clone())
        } else if let Some(map) = &class.prob_data {
            PriorSource::Map {
                map: map.clone(),
                share: 1.0,
                counted: true,
            }
        } else {
            PriorSource::None
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LevelLeaf {
    pub name: String,
    /// Index of the immediate child the leaf belongs to.
    pub child: usize,
    pub log_mean: Vec<f64>,
    pub log_covariance: DMatrix<f64>,
    pub channel_weights: Vec<f64>,
    pub gaussian: GaussianModel,
    pub source: PriorSource,
    /// Mix between the flat prior (`0`) and the spatial source (`1`).
    pub prior_weight: f64,
    pub exclude_from_incomplete: bool,
    pub include_for_normalization: bool,
}

impl LevelLeaf {
    fn new(class: &TissueClass, child: usize, source: PriorSource, prior_weight: f64) -> Result<Self> {
        Ok(Self {
            name: class.name.clone(),
            child,
            log_mean: class.log_mean.clone(),
            log_covariance: class.log_covariance.clone(),
            channel_weights: class.input_channel_weights.clone(),
            gaussian: class.gaussian()?,
            source,
            prior_weight,
            exclude_from_incomplete: class.exclude_from_incomplete_e_step,
            include_for_normalization: class.include_spatial_prior_for_normalization,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LevelChild {
    pub label: i32,
    pub leaves: Range<usize>,
    pub class_specific: bool,
    pub inv_covariance: [f64; 9],
    /// Child to superclass parameters, full form.
    pub parameters: [f64; 9],
}

/// Transforms from image voxels to atlas voxels for one level.
#[derive(Debug, Clone)]
pub(crate) struct LevelTransforms {
    pub superclass: AffineMatrix,
    /// One per immediate child; equal to `superclass` unless the child
    /// registers on its own.
    pub children: Vec<AffineMatrix>,
}

#[derive(Debug, Clone)]
pub(crate) struct LevelModel {
    pub name: String,
    pub leaves: Vec<LevelLeaf>,
    pub children: Vec<LevelChild>,
    pub markov: MarkovTensor,
    /// Registration type after the downgrade policy.
    pub registration_type: RegistrationType,
    pub interpolation: InterpolationType,
    pub two_d: bool,
    pub rigid: bool,
    /// Superclass to global parameters, full form.
    pub global_parameters: [f64; 9],
    pub generate_background: bool,
    pub independent_sub_classes: bool,
    pub pca_shape_model_type: PcaShapeModelType,
    pub stopping: StoppingCriteria,
    pub stop_bias_calculation: Option<usize>,
    pub training_samples: f64,
    pub dims: [usize; 3],
    pub mid: [f64; 3],
}

impl LevelModel {
    /// Flatten `head` into a level. With `ignore_maps` every leaf uses the
    /// flat prior.
    pub fn build(
        head: &SuperClass,
        name: &str,
        registration_type: RegistrationType,
        ignore_maps: bool,
        training_samples: f64,
        dims: [usize; 3],
    ) -> Result<Self> {
        let mut leaves = Vec::new();
        let mut children = Vec::with_capacity(head.child_count());
        for (index, slot) in head.children().iter().enumerate() {
            let node = slot.as_ref().ok_or_else(|| {
                SegmentationError::structural(format!(
                    "superclass '{}': child slot {} is empty",
                    head.name, index
                ))
            })?;
            let start = leaves.len();
            match node {
                HierarchyNode::Class(class) => {
                    let source = if head.generate_background && index == 0 {
                        PriorSource::Background
                    } else {
                        PriorSource::of_class(class)
                    };
                    leaves.push(LevelLeaf::new(class, index, source, class.prob_data_weight)?);
                }
                HierarchyNode::SuperClass(sub) => push_superclass_leaves(sub, index, &mut leaves)?,
            }
            if leaves.len() == start {
                return Err(SegmentationError::structural(format!(
                    "superclass '{}': child '{}' has no tissue classes",
                    head.name,
                    node.name()
                )));
            }
            let registration = node.registration();
            children.push(LevelChild {
                label: node.label(),
                leaves: start..leaves.len(),
                class_specific: registration.class_specific,
                inv_covariance: registration.inv_covariance,
                parameters: registration.parameters,
            });
        }
        if ignore_maps {
            for leaf in &mut leaves {
                leaf.prior_weight = 0.0;
            }
        }

        Ok(Self {
            name: name.to_string(),
            leaves,
            children,
            markov: head.markov().clone(),
            registration_type,
            interpolation: head.registration.interpolation,
            two_d: head.registration.two_d,
            rigid: head.registration.rigid,
            global_parameters: head.registration.global_parameters,
            generate_background: head.generate_background,
            independent_sub_classes: head.independent_sub_classes,
            pca_shape_model_type: head.pca_shape_model_type,
            stopping: head.stopping,
            stop_bias_calculation: head.stop_bias_calculation,
            training_samples,
            dims,
            mid: [
                (dims[0] as f64 - 1.0) * 0.5,
                (dims[1] as f64 - 1.0) * 0.5,
                (dims[2] as f64 - 1.0) * 0.5,
            ],
        })
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn has_shape_models(&self) -> bool {
        self.leaves
            .iter()
            .any(|leaf| matches!(leaf.source, PriorSource::Shape(_)))
    }

    /// Atlas transforms of the level; `None` when registration is off and
    /// atlases are read at the voxel itself.
    pub fn transforms(&self, global_to_atlas: &AffineMatrix) -> Result<Option<LevelTransforms>> {
        if self.registration_type == RegistrationType::Disabled {
            return Ok(None);
        }
        let superclass = global_to_atlas.compose(&parameters_to_inverse(&self.global_parameters)?);
        let per_child = self.registration_type == RegistrationType::ApplyOnly
            || self.registration_type.is_class_specific();
        let children = self
            .children
            .iter()
            .enumerate()
            .map(|(index, child)| {
                let background = self.generate_background && index == 0;
                if per_child && child.class_specific && !background {
                    Ok(superclass.compose(&parameters_to_inverse(&child.parameters)?))
                } else {
                    Ok(superclass)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(LevelTransforms {
            superclass,
            children,
        }))
    }

    /// Raw source values of every leaf at image voxel `pos`.
    pub fn source_values(&self, pos: [usize; 3], transforms: Option<&LevelTransforms>, out: &mut [f64]) {
        let p = [pos[0] as f64, pos[1] as f64, pos[2] as f64];
        let mut counted = 0.0;
        let mut background = None;
        for (k, leaf) in self.leaves.iter().enumerate() {
            let target = transforms.map(|t| t.children[leaf.child].map_centered(p, self.mid));
            out[k] = match &leaf.source {
                PriorSource::None => 0.0,
                PriorSource::Map {
                    map,
                    share,
                    counted: counts,
                } => {
                    let value = match target {
                        Some(at) => self.interpolation.sample(&**map, at),
                        None => map.get(pos[0], pos[1], pos[2]),
                    };
                    if *counts {
                        counted += value;
                    }
                    value * share
                }
                PriorSource::Shape(model) => {
                    let at = match target {
                        Some(at) => nearest_voxel(at, self.dims),
                        None => Some(pos),
                    };
                    let value = at.map_or(0.0, |at| {
                        model.prior_at(at, model.parameters(), self.training_samples)
                    });
                    counted += value;
                    value
                }
                PriorSource::Background => {
                    background = Some(k);
                    0.0
                }
            };
        }
        if let Some(k) = background {
            out[k] = (self.training_samples - counted).max(0.0);
        }
    }

    /// Mix the source values with the flat prior; returns the prior sum.
    pub fn spatial_priors(&self, values: &[f64], out: &mut [f64]) -> f64 {
        let flat = 1.0 / self.leaves.len() as f64;
        let mut sum = 0.0;
        for ((leaf, value), prior) in self.leaves.iter().zip(values).zip(out.iter_mut()) {
            let w = leaf.prior_weight;
            *prior = (1.0 - w) * flat + w * value / self.training_samples;
            sum += *prior;
        }
        sum
    }

    /// Summed responsibility of every child, per voxel.
    pub fn child_weights(&self, weights: &[Vec<f64>]) -> Vec<Vec<f64>> {
        self.children
            .iter()
            .map(|child| {
                let mut sum = weights[child.leaves.start].clone();
                for leaf in &weights[child.leaves.start + 1..child.leaves.end] {
                    for (s, w) in sum.iter_mut().zip(leaf) {
                        *s += w;
                    }
                }
                sum
            })
            .collect()
    }

    /// Child with the largest summed responsibility at `index` (first on
    /// ties), with that responsibility.
    pub fn dominant_child(&self, weights: &[Vec<f64>], index: usize) -> (usize, f64) {
        let mut best = (0, f64::NEG_INFINITY);
        for (c, child) in self.children.iter().enumerate() {
            let sum: f64 = weights[child.leaves.clone()].iter().map(|w| w[index]).sum();
            if sum > best.1 {
                best = (c, sum);
            }
        }
        best
    }
}

fn push_superclass_leaves(sub: &SuperClass, child: usize, leaves: &mut Vec<LevelLeaf>) -> Result<()> {
    if let Some(map) = &sub.prob_data {
        let classes = sub.leaves();
        let share = 1.0 / classes.len().max(1) as f64;
        for (i, class) in classes.into_iter().enumerate() {
            let source = PriorSource::Map {
                map: map.clone(),
                share,
                counted: i == 0,
            };
            leaves.push(LevelLeaf::new(class, child, source, sub.prob_data_weight)?);
        }
        return Ok(());
    }
    for node in sub.children().iter().flatten() {
        match node {
            HierarchyNode::Class(class) => {
                leaves.push(LevelLeaf::new(
                    class,
                    child,
                    PriorSource::of_class(class),
                    class.prob_data_weight,
                )?);
            }
            HierarchyNode::SuperClass(inner) => push_superclass_leaves(inner, child, leaves)?,
        }
    }
    Ok(())
}

/// Nearest voxel of a continuous atlas position, `None` outside the image.
pub(crate) fn nearest_voxel(p: [f64; 3], dims: [usize; 3]) -> Option<[usize; 3]> {
    let mut out = [0usize; 3];
    for axis in 0..3 {
        let rounded = (p[axis] + 0.5).floor();
        if rounded < 0.0 || rounded >= dims[axis] as f64 {
            return None;
        }
        out[axis] = rounded as usize;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use emseg_core::Volume;
    use emseg_model::RegistrationSettings;

    fn map(dims: [usize; 3], value: f32) -> Arc<ScalarVolume> {
        Arc::new(ScalarVolume::from(Volume::filled(dims, value)))
    }

    fn nested() -> SuperClass {
        let dims = [2, 2, 1];
        let tissue = SuperClass::new("tissue")
            .with_child(TissueClass::new("gm", 2, 1))
            .with_child(TissueClass::new("wm", 3, 1))
            .with_prob_data(map(dims, 0.6), 1.0);
        SuperClass::new("root")
            .with_child(TissueClass::new("bg", 1, 1))
            .with_child(tissue)
            .with_child(TissueClass::new("csf", 4, 1).with_prob_data(map(dims, 0.3), 1.0))
            .with_generate_background(true)
    }

    #[test]
    fn test_flattening() {
        let model = LevelModel::build(&nested(), "1", RegistrationType::Disabled, false, 1.0, [2, 2, 1]).unwrap();
        assert_eq!(model.leaf_count(), 4);
        assert_eq!(model.child_count(), 3);
        assert_eq!(model.children[1].leaves, 1..3);
        assert_eq!(model.children.iter().map(|c| c.label).collect::<Vec<_>>(), vec![1, -1, 4]);
        assert!(matches!(model.leaves[0].source, PriorSource::Background));
        assert!(matches!(model.leaves[2].source, PriorSource::Map { counted: false, .. }));
    }

    #[test]
    fn test_background_and_shared_maps() {
        let model = LevelModel::build(&nested(), "1", RegistrationType::Disabled, false, 1.0, [2, 2, 1]).unwrap();
        let mut values = vec![0.0; 4];
        model.source_values([1, 1, 0], None, &mut values);
        // the tissue map counts once; background takes what is left of N
        assert!((values[0] - 0.1).abs() < 1e-6);
        assert!((values[1] - 0.3).abs() < 1e-6);
        assert!((values[2] - 0.3).abs() < 1e-6);
        assert!((values[3] - 0.3).abs() < 1e-6);

        let mut priors = vec![0.0; 4];
        let sum = model.spatial_priors(&values, &mut priors);
        // the background class carries weight 0 and gets the flat quarter
        assert!((priors[0] - 0.25).abs() < 1e-12);
        assert!((sum - (0.25 + 0.9)).abs() < 1e-6);
    }

    #[test]
    fn test_ignore_maps_flattens_priors() {
        let model = LevelModel::build(&nested(), "1-1", RegistrationType::Disabled, true, 1.0, [2, 2, 1]).unwrap();
        let mut values = vec![0.0; 4];
        let mut priors = vec![0.0; 4];
        model.source_values([0, 0, 0], None, &mut values);
        let sum = model.spatial_priors(&values, &mut priors);
        assert!(priors.iter().all(|&p| (p - 0.25).abs() < 1e-12));
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_transforms_follow_registration_type() {
        let mut head = nested();
        head.registration = RegistrationSettings::new(RegistrationType::GlobalOnly);
        head.registration.global_parameters = [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let model = LevelModel::build(&head, "1", RegistrationType::GlobalOnly, false, 1.0, [2, 2, 1]).unwrap();
        let transforms = model.transforms(&AffineMatrix::identity()).unwrap().unwrap();
        assert_eq!(transforms.children.len(), 3);
        let moved = transforms.superclass.map_centered([0.0, 0.0, 0.0], model.mid);
        assert!((moved[0] + 2.0).abs() < 1e-12);

        let off = LevelModel::build(&head, "1", RegistrationType::Disabled, false, 1.0, [2, 2, 1]).unwrap();
        assert!(off.transforms(&AffineMatrix::identity()).unwrap().is_none());
    }

    #[test]
    fn test_dominant_child_sums_leaves() {
        let model = LevelModel::build(&nested(), "1", RegistrationType::Disabled, false, 1.0, [2, 2, 1]).unwrap();
        let weights = vec![vec![0.4], vec![0.25], vec![0.25], vec![0.1]];
        assert_eq!(model.dominant_child(&weights, 0).0, 1);
        let sums = model.child_weights(&weights);
        assert_eq!(sums[1], vec![0.5]);
    }

    #[test]
    fn test_nearest_voxel() {
        assert_eq!(nearest_voxel([0.4, 1.6, 0.0], [2, 3, 1]), Some([0, 2, 0]));
        assert_eq!(nearest_voxel([-0.6, 0.0, 0.0], [2, 3, 1]), None);
        assert_eq!(nearest_voxel([1.5, 0.0, 0.0], [2, 3, 1]), None);
    }
}
