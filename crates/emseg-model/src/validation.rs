//! Subtree validation.
//!
//! [`validate`] checks that everything reachable from a superclass agrees on
//! channel count, probability-map scalar type, dimensions, spacing and
//! segmentation boundary, and that every MRF entry lies in `[0, 1]`.
//! [`update`] applies the pre-segmentation fixes and then validates.

use emseg_core::{RegionBox, Result, ScalarType, SegmentationError, Spacing};

use crate::diagnostics::Diagnostics;
use crate::node::HierarchyNode;
use crate::superclass::SuperClass;

#[derive(Debug, Default)]
struct Reference {
    channels: Option<usize>,
    scalar_type: Option<ScalarType>,
    dims: Option<[usize; 3]>,
    spacing: Option<Spacing>,
    boundary: Option<RegionBox>,
}

impl Reference {
    fn check_geometry(&mut self, node: &str, field: &str, dims: [usize; 3]) -> Result<()> {
        match self.dims {
            None => {
                self.dims = Some(dims);
                Ok(())
            }
            Some(expected) if expected == dims => Ok(()),
            Some(expected) => Err(SegmentationError::structural(format!(
                "'{}': {} has dimensions {:?}, expected {:?}",
                node, field, dims, expected
            ))),
        }
    }

    fn check_spacing(&mut self, node: &str, field: &str, spacing: Spacing) -> Result<()> {
        match self.spacing {
            None => {
                self.spacing = Some(spacing);
                Ok(())
            }
            Some(expected) if expected.matches(&spacing) => Ok(()),
            Some(expected) => Err(SegmentationError::structural(format!(
                "'{}': {} has spacing {:?}, expected {:?}",
                node, field, spacing.0, expected.0
            ))),
        }
    }

    fn check_scalar_type(&mut self, node: &str, scalar_type: ScalarType) -> Result<()> {
        match self.scalar_type {
            None => {
                self.scalar_type = Some(scalar_type);
                Ok(())
            }
            Some(expected) if expected == scalar_type => Ok(()),
            Some(expected) => Err(SegmentationError::structural(format!(
                "'{}': probability map is {}, expected {}",
                node, scalar_type, expected
            ))),
        }
    }
}

/// Validate the subtree rooted at `root`.
pub fn validate(root: &SuperClass) -> Result<()> {
    let mut reference = Reference::default();
    validate_superclass(root, &mut reference)?;
    if let (Some(boundary), Some(dims)) = (reference.boundary, reference.dims) {
        boundary.validate_against(dims).map_err(|e| {
            SegmentationError::structural(format!("'{}': segmentation boundary: {}", root.name, e))
        })?;
    }
    Ok(())
}

fn validate_superclass(node: &SuperClass, reference: &mut Reference) -> Result<()> {
    if node.child_count() == 0 {
        return Err(SegmentationError::structural(format!(
            "'{}': superclass has no children",
            node.name
        )));
    }
    if node.markov().size() != node.child_count() {
        return Err(SegmentationError::structural(format!(
            "'{}': MRF tensor is {}x{} for {} children",
            node.name,
            node.markov().size(),
            node.markov().size(),
            node.child_count()
        )));
    }
    if let Some((direction, i, j, value)) = node.markov().find_out_of_range() {
        return Err(SegmentationError::structural(format!(
            "'{}': MRF entry {:?}[{}][{}] = {} outside [0, 1]",
            node.name, direction, i, j, value
        )));
    }
    if node.generate_background {
        if node.child_count() < 2 {
            return Err(SegmentationError::structural(format!(
                "'{}': a generated background needs at least one sibling",
                node.name
            )));
        }
        if !matches!(node.child(0), Some(HierarchyNode::Class(_))) {
            return Err(SegmentationError::structural(format!(
                "'{}': the generated background must be a class in slot 0",
                node.name
            )));
        }
    }
    if let Some(boundary) = node.segmentation_boundary {
        match reference.boundary {
            None => reference.boundary = Some(boundary),
            Some(expected) if expected == boundary => {}
            Some(expected) => {
                return Err(SegmentationError::structural(format!(
                    "'{}': segmentation boundary {:?}..{:?} differs from {:?}..{:?}",
                    node.name,
                    boundary.min(),
                    boundary.max(),
                    expected.min(),
                    expected.max()
                )))
            }
        }
    }
    if let Some(map) = &node.prob_data {
        reference.check_scalar_type(&node.name, map.scalar_type())?;
        reference.check_geometry(&node.name, "probability map", map.dims())?;
        reference.check_spacing(&node.name, "probability map", map.spacing())?;
    }

    for (index, slot) in node.children().iter().enumerate() {
        match slot {
            None => {
                return Err(SegmentationError::structural(format!(
                    "'{}': child slot {} is empty",
                    node.name, index
                )))
            }
            Some(HierarchyNode::SuperClass(sub)) => validate_superclass(sub, reference)?,
            Some(HierarchyNode::Class(class)) => {
                let channels = class.channel_count();
                if channels == 0 {
                    return Err(SegmentationError::structural(format!(
                        "'{}': class has no intensity channels",
                        class.name
                    )));
                }
                match reference.channels {
                    None => reference.channels = Some(channels),
                    Some(expected) if expected == channels => {}
                    Some(expected) => {
                        return Err(SegmentationError::structural(format!(
                            "'{}': {} channels, expected {}",
                            class.name, channels, expected
                        )))
                    }
                }
                let cov = &class.log_covariance;
                if cov.nrows() != channels || cov.ncols() != channels {
                    return Err(SegmentationError::structural(format!(
                        "'{}': log covariance is {}x{} for {} channels",
                        class.name,
                        cov.nrows(),
                        cov.ncols(),
                        channels
                    )));
                }
                if class.input_channel_weights.len() != channels {
                    return Err(SegmentationError::structural(format!(
                        "'{}': {} channel weights for {} channels",
                        class.name,
                        class.input_channel_weights.len(),
                        channels
                    )));
                }
                if let Some(map) = &class.prob_data {
                    reference.check_scalar_type(&class.name, map.scalar_type())?;
                    reference.check_geometry(&class.name, "probability map", map.dims())?;
                    reference.check_spacing(&class.name, "probability map", map.spacing())?;
                }
                if let Some(shape) = &class.shape_model {
                    reference.check_geometry(&class.name, "mean shape", shape.dims())?;
                    reference.check_spacing(&class.name, "mean shape", shape.mean_shape().spacing())?;
                }
            }
        }
    }
    Ok(())
}

/// Apply pre-segmentation fixes, then [`validate`].
///
/// A class asking for a spatial prior (`prob_data_weight > 0`) without a
/// probability map or shape model has its weight reset to zero. The class
/// in slot 0 of a superclass that generates its background is exempt; its
/// prior is derived from its siblings.
pub fn update(root: &mut SuperClass, diagnostics: &mut Diagnostics) -> Result<()> {
    reset_orphan_weights(root, diagnostics);
    validate(root)
}

fn reset_orphan_weights(node: &mut SuperClass, diagnostics: &mut Diagnostics) {
    let level = node.name.clone();
    let generated = node.generate_background;
    for (index, child) in node.children_mut().iter_mut().enumerate() {
        let Some(child) = child else { continue };
        match child {
            HierarchyNode::SuperClass(sub) => reset_orphan_weights(sub, diagnostics),
            HierarchyNode::Class(_) if generated && index == 0 => {}
            HierarchyNode::Class(class) => {
                if class.prob_data_weight > 0.0 && !class.has_spatial_prior() {
                    diagnostics.warn(
                        &level,
                        format!(
                            "class '{}' has prob_data_weight {} but no probability map; weight set to 0",
                            class.name, class.prob_data_weight
                        ),
                    );
                    class.prob_data_weight = 0.0;
                }
            }
        }
    }
}
