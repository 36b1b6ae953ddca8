//! PCA shape M-step.

use emseg_core::{AffineMatrix, Result};
use emseg_model::{HierarchyNode, PcaShapeModelType, SuperClass, TissueClass};
use emseg_registration::{
    DirectionSetOptimizer, OptimizerAdapter, ShapeChild, ShapeCostFunction, ShapeLeaf, ShapeProblem,
};
use tracing::debug;

use crate::level::{LevelModel, LevelTransforms, PriorSource};
use crate::register::{roi_box, MStepContext, MStepOutcome};

/// Whether the level estimates shape coefficients at all.
pub(crate) fn estimates_shape(model: &LevelModel) -> bool {
    model.pca_shape_model_type != PcaShapeModelType::Apply && model.has_shape_models()
}

/// Fit the shape coefficients of every leaf to the current
/// responsibilities. Returns `None` when there is no ROI to fit over.
pub(crate) fn fit_shapes(
    model: &mut LevelModel,
    head: &mut SuperClass,
    transforms: Option<&LevelTransforms>,
    ctx: &MStepContext<'_>,
) -> Result<Option<MStepOutcome>> {
    let boundary = ctx.input.boundary;
    let Some(relative) = roi_box(&boundary, ctx.status) else {
        return Ok(None);
    };
    let superclass_to_atlas = transforms.map_or_else(AffineMatrix::identity, |t| t.superclass);
    let children = model
        .children
        .iter()
        .enumerate()
        .map(|(c, child)| ShapeChild {
            leaves: model.leaves[child.leaves.clone()]
                .iter()
                .zip(&ctx.weights[child.leaves.clone()])
                .map(|(leaf, weights)| {
                    let (shape_model, prob_data) = match &leaf.source {
                        PriorSource::Shape(shape) => (Some(shape.clone()), None),
                        PriorSource::Map { map, .. } => (None, Some(map.clone())),
                        _ => (None, None),
                    };
                    ShapeLeaf {
                        weights: weights.as_slice().into(),
                        shape_model,
                        prob_data,
                        include_spatial_prior_for_normalization: leaf.include_for_normalization,
                    }
                })
                .collect(),
            to_atlas: transforms.map_or(superclass_to_atlas, |t| t.children[c]),
        })
        .collect();
    let problem = ShapeProblem {
        model_type: model.pca_shape_model_type,
        registration_type: model.registration_type,
        training_samples: model.training_samples,
        image_dims: model.dims,
        boundary,
        pca_box: relative.offset_by(boundary.min()),
        status: ctx.status.into(),
        children,
        superclass_to_atlas,
    };
    let mut cost = ShapeCostFunction::new(problem, ctx.pool.clone())?;
    let initial = cost.parameters_to_array();
    if initial.is_empty() {
        return Ok(None);
    }
    let result = {
        let mut adapter = OptimizerAdapter::new().with_shape(&mut cost);
        ctx.optimizer.minimize(&mut adapter, &initial)?
    };
    let per_leaf = cost.array_to_parameters(&result.parameters)?;

    let mut tree_leaves = Vec::new();
    collect_leaves_mut(head, &mut tree_leaves);
    for ((leaf, class), parameters) in model.leaves.iter_mut().zip(tree_leaves).zip(&per_leaf) {
        if parameters.is_empty() {
            continue;
        }
        if let PriorSource::Shape(shape) = &mut leaf.source {
            shape.set_parameters(parameters);
        }
        if let Some(shape) = class.shape_model.as_mut() {
            shape.set_parameters(parameters);
        }
    }
    debug!(
        level = %model.name,
        cost = result.cost,
        evaluations = result.evaluations,
        "shape step finished"
    );
    Ok(Some(MStepOutcome {
        cost: result.cost,
        evaluations: result.evaluations,
        converged: result.converged,
    }))
}

/// Tissue classes below `node` in depth-first order, matching the leaf
/// order of a [`LevelModel`].
fn collect_leaves_mut<'a>(node: &'a mut SuperClass, out: &mut Vec<&'a mut TissueClass>) {
    for child in node.children_mut().iter_mut().flatten() {
        match child {
            HierarchyNode::Class(class) => out.push(class),
            HierarchyNode::SuperClass(sub) => collect_leaves_mut(sub, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::EngineConfig;
    use crate::input::{PreparedInput, SegmentationInput};
    use emseg_core::{build_worker_pool, ScalarVolume, Volume};
    use emseg_model::{LogisticTransfer, PcaShapeModel, RegistrationType, VoxelStatus};
    use emseg_registration::{CoordinateSearch, OptimizerConfig};

    /// Signed distance to the plane `x = 3 + s`; positive on the side the
    /// class occupies.
    fn plane_model(dims: [usize; 3], sign: f32) -> PcaShapeModel {
        let mean = Volume::from_fn(dims, |x, _, _| sign * (3.0 - x as f32));
        let mode = Volume::filled(dims, sign);
        PcaShapeModel::new(
            Arc::new(mean),
            vec![Arc::new(mode)],
            vec![4.0],
            LogisticTransfer::new(2.0, 0.0, -6.0, 6.0),
        )
        .unwrap()
    }

    #[test]
    fn test_shape_fit_lowers_the_cost_and_follows_the_weights() {
        let dims = [8, 4, 1];
        let mut head = SuperClass::new("root")
            .with_child(TissueClass::new("left", 1, 1).with_shape_model(plane_model(dims, 1.0), 1.0))
            .with_child(TissueClass::new("right", 2, 1).with_shape_model(plane_model(dims, -1.0), 1.0));
        let input = SegmentationInput::new(vec![Arc::new(ScalarVolume::from(Volume::filled(dims, 1.0f32)))]);
        let prepared = PreparedInput::prepare(&input, &head).unwrap();
        let mut model = LevelModel::build(&head, "1", RegistrationType::Disabled, false, 1.0, dims).unwrap();
        assert!(estimates_shape(&model));

        // responsibilities put the boundary at x = 5 instead of 3
        let left: Vec<f64> = (0..32).map(|i| if i % 8 < 5 { 1.0 } else { 0.0 }).collect();
        let right: Vec<f64> = left.iter().map(|w| 1.0 - w).collect();
        let weights = vec![left, right];
        let status = vec![VoxelStatus::Regular; 32];
        let config = EngineConfig::default();
        let pool = build_worker_pool(Some(2)).unwrap();
        let mut fit = |optimizer: CoordinateSearch| {
            let ctx = MStepContext {
                input: &prepared,
                weights: &weights,
                status: &status,
                global_to_atlas: &AffineMatrix::identity(),
                config: &config,
                optimizer: &optimizer,
                pool: &pool,
            };
            fit_shapes(&mut model, &mut head, None, &ctx).unwrap().unwrap()
        };
        // a single evaluation leaves the coefficients where they started
        let start = fit(CoordinateSearch::new(OptimizerConfig::default().with_max_evaluations(1)).unwrap());
        let outcome = fit(CoordinateSearch::new(OptimizerConfig::default().with_tolerance(0.01)).unwrap());
        assert!(outcome.evaluations > 1);
        assert!(outcome.cost < start.cost, "{} >= {}", outcome.cost, start.cost);

        // the normalised priors now switch sides between x = 4 and x = 5
        let leaves = head.leaves();
        let prior = |leaf: usize, x: usize| {
            let shape = leaves[leaf].shape_model.as_ref().unwrap();
            shape.prior_at([x, 0, 0], shape.parameters(), 1.0)
        };
        assert!(prior(0, 4) > prior(1, 4), "{} <= {}", prior(0, 4), prior(1, 4));
        assert!(prior(0, 5) < prior(1, 5), "{} >= {}", prior(0, 5), prior(1, 5));

        let fitted = leaves[0].shape_model.as_ref().unwrap().parameters().to_vec();
        match &model.leaves[0].source {
            PriorSource::Shape(shape) => assert_eq!(shape.parameters(), fitted.as_slice()),
            other => panic!("unexpected source {:?}", other),
        }
    }
}
