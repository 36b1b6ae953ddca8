//! Internal tree nodes.

use std::sync::Arc;

use emseg_core::{RegionBox, Result, ScalarVolume, SegmentationError};
use serde::{Deserialize, Serialize};

use crate::class::TissueClass;
use crate::markov::MarkovTensor;
use crate::node::{ChildRegistration, HierarchyNode};
use crate::registration::RegistrationSettings;
use crate::shape::PcaShapeModelType;

/// Measure that ends the EM loop of a superclass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopType {
    /// Run exactly `max_iterations` iterations.
    #[default]
    Fixed,
    /// Stop once at most `value` voxels change label.
    LabelMap,
    /// Stop once the responsibility mass changes by at most `value` percent.
    Weights,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoppingCriteria {
    pub stop_type: StopType,
    pub value: f64,
    pub max_iterations: usize,
}

impl Default for StoppingCriteria {
    fn default() -> Self {
        Self {
            stop_type: StopType::Fixed,
            value: 0.0,
            max_iterations: 10,
        }
    }
}

impl StoppingCriteria {
    pub fn fixed(iterations: usize) -> Self {
        Self {
            stop_type: StopType::Fixed,
            value: 0.0,
            max_iterations: iterations,
        }
    }

    pub fn label_map(threshold: f64, max_iterations: usize) -> Self {
        Self {
            stop_type: StopType::LabelMap,
            value: threshold,
            max_iterations,
        }
    }

    pub fn weights(percent: f64, max_iterations: usize) -> Self {
        Self {
            stop_type: StopType::Weights,
            value: percent,
            max_iterations,
        }
    }
}

/// Internal node: ordered children, their MRF tensor and the EM settings
/// used when this node is segmented.
#[derive(Debug, Clone)]
pub struct SuperClass {
    pub name: String,
    /// Assigned by [`assign_labels`](crate::labels::assign_labels).
    pub label: i32,
    children: Vec<Option<HierarchyNode>>,
    markov: MarkovTensor,
    pub prob_data_weight: f64,
    pub prob_data: Option<Arc<ScalarVolume>>,
    pub stopping: StoppingCriteria,
    pub registration: RegistrationSettings,
    pub generate_background: bool,
    pub pca_shape_model_type: PcaShapeModelType,
    pub independent_sub_classes: bool,
    pub stop_bias_calculation: Option<usize>,
    pub segmentation_boundary: Option<RegionBox>,
    pub child_registration: ChildRegistration,
}

impl SuperClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: -1,
            children: Vec::new(),
            markov: MarkovTensor::new(0),
            prob_data_weight: 0.0,
            prob_data: None,
            stopping: StoppingCriteria::default(),
            registration: RegistrationSettings::default(),
            generate_background: false,
            pca_shape_model_type: PcaShapeModelType::default(),
            independent_sub_classes: false,
            stop_bias_calculation: None,
            segmentation_boundary: None,
            child_registration: ChildRegistration::default(),
        }
    }

    /// Install `node` at `index`, growing the child array (and the MRF
    /// tensor) when needed. Returns the node previously stored there.
    pub fn add_child(&mut self, node: impl Into<HierarchyNode>, index: usize) -> Option<HierarchyNode> {
        if index >= self.children.len() {
            self.children.resize_with(index + 1, || None);
            self.markov.resize(index + 1);
        }
        self.children[index].replace(node.into())
    }

    /// Append a child, returning its index.
    pub fn push_child(&mut self, node: impl Into<HierarchyNode>) -> usize {
        let index = self.children.len();
        self.add_child(node, index);
        index
    }

    /// Detach the child at `index`, leaving an empty slot.
    pub fn take_child(&mut self, index: usize) -> Option<HierarchyNode> {
        self.children.get_mut(index).and_then(Option::take)
    }

    pub fn with_child(mut self, node: impl Into<HierarchyNode>) -> Self {
        self.push_child(node);
        self
    }

    pub fn with_markov(mut self, markov: MarkovTensor) -> Self {
        self.markov = markov;
        self
    }

    pub fn with_prob_data(mut self, prob_data: Arc<ScalarVolume>, weight: f64) -> Self {
        self.prob_data = Some(prob_data);
        self.prob_data_weight = weight;
        self
    }

    pub fn with_prob_data_weight(mut self, weight: f64) -> Self {
        self.prob_data_weight = weight;
        self
    }

    pub fn with_stopping(mut self, stopping: StoppingCriteria) -> Self {
        self.stopping = stopping;
        self
    }

    pub fn with_registration(mut self, registration: RegistrationSettings) -> Self {
        self.registration = registration;
        self
    }

    pub fn with_generate_background(mut self, generate: bool) -> Self {
        self.generate_background = generate;
        self
    }

    pub fn with_pca_shape_model_type(mut self, kind: PcaShapeModelType) -> Self {
        self.pca_shape_model_type = kind;
        self
    }

    pub fn with_independent_sub_classes(mut self, independent: bool) -> Self {
        self.independent_sub_classes = independent;
        self
    }

    pub fn with_stop_bias_calculation(mut self, iterations: Option<usize>) -> Self {
        self.stop_bias_calculation = iterations;
        self
    }

    pub fn with_segmentation_boundary(mut self, boundary: RegionBox) -> Self {
        self.segmentation_boundary = Some(boundary);
        self
    }

    pub fn with_child_registration(mut self, registration: ChildRegistration) -> Self {
        self.child_registration = registration;
        self
    }

    pub fn children(&self) -> &[Option<HierarchyNode>] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Option<HierarchyNode>] {
        &mut self.children
    }

    pub fn child(&self, index: usize) -> Option<&HierarchyNode> {
        self.children.get(index).and_then(Option::as_ref)
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn markov(&self) -> &MarkovTensor {
        &self.markov
    }

    /// Replace the MRF tensor; its size must match the child count.
    pub fn set_markov(&mut self, markov: MarkovTensor) -> Result<()> {
        if markov.size() != self.children.len() {
            return Err(SegmentationError::dimension_mismatch(format!(
                "superclass '{}' has {} children but the MRF tensor is {}x{}",
                self.name,
                self.children.len(),
                markov.size(),
                markov.size()
            )));
        }
        self.markov = markov;
        Ok(())
    }

    pub fn markov_mut(&mut self) -> &mut MarkovTensor {
        &mut self.markov
    }

    pub fn leaf_count(&self) -> usize {
        self.children.iter().flatten().map(HierarchyNode::leaf_count).sum()
    }

    /// Leaves reachable from this node in depth-first child order.
    pub fn leaves(&self) -> Vec<&TissueClass> {
        self.children
            .iter()
            .flatten()
            .flat_map(HierarchyNode::leaves)
            .collect()
    }

    /// Nodes below this one: leaves, plus superclasses when asked.
    pub fn total_class_count(&self, include_superclasses: bool) -> usize {
        self.children
            .iter()
            .flatten()
            .map(|child| match child {
                HierarchyNode::Class(_) => 1,
                HierarchyNode::SuperClass(s) => {
                    s.total_class_count(include_superclasses) + usize::from(include_superclasses)
                }
            })
            .sum()
    }

    /// Sorted, unique leaf labels greater than `-1`.
    pub fn all_labels(&self) -> Vec<i32> {
        let mut labels: Vec<i32> = self
            .leaves()
            .into_iter()
            .map(|c| c.label)
            .filter(|&l| l > -1)
            .collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }

    /// Total PCA modes of the leaves, respecting the shared vector of the
    /// dependent model.
    pub fn pca_parameter_count(&self) -> usize {
        let modes = self.leaves().into_iter().map(TissueClass::pca_mode_count);
        match self.pca_shape_model_type {
            PcaShapeModelType::Dependent => modes.max().unwrap_or(0),
            _ => modes.sum(),
        }
    }
}
