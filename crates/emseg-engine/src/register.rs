//! Registration M-step.
//!
//! Builds a [`RegistrationProblem`] from the current responsibilities,
//! minimises it with the engine's optimizer and writes the parameters back
//! into both the level and the caller's tree.

use std::sync::Arc;

use emseg_core::transform::parameters_to_inverse;
use emseg_core::{AffineMatrix, ParameterLayout, Result, Volume, VoxelBox};
use emseg_model::{RegistrationType, SuperClass, VoxelStatus};
use emseg_registration::{
    CoordinateSearch, DirectionSetOptimizer, OptimizerAdapter, RegistrationChild,
    RegistrationCostFunction, RegistrationLeaf, RegistrationProblem,
};
use rayon::ThreadPool;
use tracing::debug;

use crate::config::EngineConfig;
use crate::input::PreparedInput;
use crate::level::{LevelChild, LevelModel, PriorSource};

/// Share of the responsibility (or atlas mass) a child needs to dominate a
/// voxel in the global-only shortcut maps.
const DOMINANCE: f64 = 0.99;

/// Inputs of one M-step shared by registration and shape estimation.
pub(crate) struct MStepContext<'a> {
    pub input: &'a PreparedInput,
    pub weights: &'a [Vec<f64>],
    pub status: &'a [VoxelStatus],
    pub global_to_atlas: &'a AffineMatrix,
    pub config: &'a EngineConfig,
    pub optimizer: &'a CoordinateSearch,
    pub pool: &'a Arc<ThreadPool>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MStepOutcome {
    pub cost: f64,
    pub evaluations: usize,
    pub converged: bool,
}

pub(crate) fn register_level(
    model: &mut LevelModel,
    head: &mut SuperClass,
    ctx: &MStepContext<'_>,
) -> Result<MStepOutcome> {
    let kind = model.registration_type;
    let layout = ParameterLayout::new(model.two_d, model.rigid);
    let problem = build_problem(model, layout, ctx)?;
    let mut cost = RegistrationCostFunction::new(problem, ctx.pool.clone())?;

    let initial = initial_parameters(model, layout);
    let result = {
        let mut adapter = OptimizerAdapter::new().with_registration(&mut cost);
        ctx.optimizer.minimize(&mut adapter, &initial)?
    };
    let mut parameters = result.parameters;
    cost.finalize(&mut parameters);

    let mut sets = parameters.chunks(layout.per_set());
    if kind != RegistrationType::ClassOnly {
        if let Some(set) = sets.next() {
            let full = layout.expand(set)?;
            model.global_parameters = full;
            head.registration.global_parameters = full;
        }
    }
    if kind.is_class_specific() {
        for index in class_specific_children(model).collect::<Vec<_>>() {
            let Some(set) = sets.next() else { break };
            let full = layout.expand(set)?;
            model.children[index].parameters = full;
            if let Some(node) = head.children_mut()[index].as_mut() {
                node.registration_mut().parameters = full;
            }
        }
    }
    debug!(
        level = %model.name,
        cost = result.cost,
        evaluations = result.evaluations,
        global = ?model.global_parameters,
        "registration step finished"
    );
    Ok(MStepOutcome {
        cost: result.cost,
        evaluations: result.evaluations,
        converged: result.converged,
    })
}

/// Indices of the children that own a parameter set.
fn class_specific_children(model: &LevelModel) -> impl Iterator<Item = usize> + '_ {
    let skip = usize::from(model.generate_background);
    model
        .children
        .iter()
        .enumerate()
        .skip(skip)
        .filter(|(_, child)| child.class_specific)
        .map(|(index, _)| index)
}

fn initial_parameters(model: &LevelModel, layout: ParameterLayout) -> Vec<f64> {
    let mut initial = Vec::new();
    if model.registration_type != RegistrationType::ClassOnly {
        initial.extend(layout.reduce(&model.global_parameters));
    }
    if model.registration_type.is_class_specific() {
        for index in class_specific_children(model).collect::<Vec<_>>() {
            initial.extend(layout.reduce(&model.children[index].parameters));
        }
    }
    initial
}

fn build_problem(model: &LevelModel, layout: ParameterLayout, ctx: &MStepContext<'_>) -> Result<RegistrationProblem> {
    let kind = model.registration_type;
    let boundary = ctx.input.boundary;
    let children = model
        .children
        .iter()
        .map(|child| RegistrationChild {
            leaves: registration_leaves(model, child, ctx.weights),
            class_specific: child.class_specific,
            inv_covariance: child.inv_covariance,
            independent_sub_classes: model.independent_sub_classes,
        })
        .collect();
    let (weight_map, prob_data_map) = if kind == RegistrationType::GlobalOnly {
        (
            Some(dominant_weight_map(model, ctx.weights, ctx.status)),
            Some(Arc::new(dominant_atlas_map(model))),
        )
    } else {
        (None, None)
    };
    Ok(RegistrationProblem {
        registration_type: kind,
        layout,
        interpolation: model.interpolation,
        generate_background: model.generate_background,
        training_samples: model.training_samples,
        penalty_divisor: ctx.config.registration_penalty_divisor,
        image_dims: model.dims,
        boundary,
        weight_roi: roi_box(&boundary, ctx.status),
        status: ctx.status.into(),
        children,
        weight_map,
        prob_data_map,
        global_to_atlas: *ctx.global_to_atlas,
        superclass_to_global: parameters_to_inverse(&model.global_parameters)?,
    })
}

/// Leaves of one child as the cost function sees them. A map shared by
/// the leaves of a nested superclass becomes one leaf carrying their
/// summed responsibilities.
fn registration_leaves(model: &LevelModel, child: &LevelChild, weights: &[Vec<f64>]) -> Vec<RegistrationLeaf> {
    let mut leaves: Vec<(Vec<f64>, Option<_>)> = Vec::new();
    for k in child.leaves.clone() {
        match &model.leaves[k].source {
            PriorSource::Map { counted: false, .. } if !leaves.is_empty() => {
                if let Some((sum, _)) = leaves.last_mut() {
                    for (s, w) in sum.iter_mut().zip(&weights[k]) {
                        *s += w;
                    }
                }
            }
            PriorSource::Map { map, .. } => leaves.push((weights[k].clone(), Some(map.clone()))),
            _ => leaves.push((weights[k].clone(), None)),
        }
    }
    leaves
        .into_iter()
        .map(|(weights, prob_data)| RegistrationLeaf {
            weights: weights.into(),
            prob_data,
        })
        .collect()
}

/// Bounding box of the ROI voxels, relative to the boundary.
pub(crate) fn roi_box(boundary: &VoxelBox, status: &[VoxelStatus]) -> Option<VoxelBox> {
    let relative = VoxelBox::full(boundary.lengths());
    bounding_box(status.iter().enumerate().filter(|(_, s)| s.in_roi()).map(|(i, _)| relative.coordinate(i)))
}

fn bounding_box(points: impl Iterator<Item = [usize; 3]>) -> Option<VoxelBox> {
    let mut bounds: Option<([usize; 3], [usize; 3])> = None;
    for p in points {
        bounds = Some(match bounds {
            None => (p, p),
            Some((lo, hi)) => (
                [lo[0].min(p[0]), lo[1].min(p[1]), lo[2].min(p[2])],
                [hi[0].max(p[0]), hi[1].max(p[1]), hi[2].max(p[2])],
            ),
        });
    }
    bounds.map(|(lo, hi)| VoxelBox::new(lo, hi))
}

/// Dominant child per boundary voxel, `-1` where none dominates.
fn dominant_weight_map(model: &LevelModel, weights: &[Vec<f64>], status: &[VoxelStatus]) -> Arc<[i32]> {
    (0..status.len())
        .map(|i| {
            if !status[i].in_roi() {
                return -1;
            }
            let (child, share) = model.dominant_child(weights, i);
            if share > DOMINANCE {
                child as i32
            } else {
                -1
            }
        })
        .collect()
}

/// Dominant child per atlas voxel, `-1` where none dominates.
fn dominant_atlas_map(model: &LevelModel) -> Volume<i32> {
    let n = model.training_samples;
    Volume::from_fn(model.dims, |x, y, z| {
        let mut mass = vec![0.0; model.child_count()];
        let mut background = None;
        for (c, child) in model.children.iter().enumerate() {
            for leaf in &model.leaves[child.leaves.clone()] {
                match &leaf.source {
                    PriorSource::Map { map, share, .. } => mass[c] += map.get(x, y, z) * share,
                    PriorSource::Background => background = Some(c),
                    _ => {}
                }
            }
        }
        if let Some(c) = background {
            let others: f64 = mass.iter().sum();
            mass[c] = (n - others).max(0.0);
        }
        mass.iter()
            .position(|&m| m / n > DOMINANCE)
            .map_or(-1, |c| c as i32)
    })
}
