//! Tree nodes.

use serde::{Deserialize, Serialize};

use crate::class::TissueClass;
use crate::superclass::SuperClass;

/// Kind tag of a [`HierarchyNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Class,
    SuperClass,
}

/// Registration data a node carries as the child of a superclass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChildRegistration {
    /// Receives its own parameter set under class-specific registration.
    pub class_specific: bool,
    /// Diagonal inverse covariance of the node's parameters, in full
    /// parameter order.
    pub inv_covariance: [f64; 9],
    /// Node to superclass parameters, full 9-entry form.
    pub parameters: [f64; 9],
}

impl Default for ChildRegistration {
    fn default() -> Self {
        Self {
            class_specific: false,
            inv_covariance: [0.0; 9],
            parameters: [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        }
    }
}

impl ChildRegistration {
    pub fn class_specific(inv_covariance: [f64; 9]) -> Self {
        Self {
            class_specific: true,
            inv_covariance,
            ..Self::default()
        }
    }
}

/// Closed two-variant node type of the hierarchy.
#[derive(Debug, Clone)]
pub enum HierarchyNode {
    Class(TissueClass),
    SuperClass(SuperClass),
}

impl HierarchyNode {
    pub fn kind(&self) -> NodeKind {
        match self {
            HierarchyNode::Class(_) => NodeKind::Class,
            HierarchyNode::SuperClass(_) => NodeKind::SuperClass,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            HierarchyNode::Class(c) => &c.name,
            HierarchyNode::SuperClass(s) => &s.name,
        }
    }

    pub fn label(&self) -> i32 {
        match self {
            HierarchyNode::Class(c) => c.label,
            HierarchyNode::SuperClass(s) => s.label,
        }
    }

    pub fn prob_data_weight(&self) -> f64 {
        match self {
            HierarchyNode::Class(c) => c.prob_data_weight,
            HierarchyNode::SuperClass(s) => s.prob_data_weight,
        }
    }

    pub fn registration(&self) -> &ChildRegistration {
        match self {
            HierarchyNode::Class(c) => &c.registration,
            HierarchyNode::SuperClass(s) => &s.child_registration,
        }
    }

    pub fn registration_mut(&mut self) -> &mut ChildRegistration {
        match self {
            HierarchyNode::Class(c) => &mut c.registration,
            HierarchyNode::SuperClass(s) => &mut s.child_registration,
        }
    }

    pub fn as_class(&self) -> Option<&TissueClass> {
        match self {
            HierarchyNode::Class(c) => Some(c),
            HierarchyNode::SuperClass(_) => None,
        }
    }

    pub fn as_superclass(&self) -> Option<&SuperClass> {
        match self {
            HierarchyNode::SuperClass(s) => Some(s),
            HierarchyNode::Class(_) => None,
        }
    }

    pub fn as_superclass_mut(&mut self) -> Option<&mut SuperClass> {
        match self {
            HierarchyNode::SuperClass(s) => Some(s),
            HierarchyNode::Class(_) => None,
        }
    }

    /// Leaves reachable from this node, depth first, in child order.
    pub fn leaves(&self) -> Vec<&TissueClass> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a TissueClass>) {
        match self {
            HierarchyNode::Class(c) => out.push(c),
            HierarchyNode::SuperClass(s) => {
                for child in s.children().iter().flatten() {
                    child.collect_leaves(out);
                }
            }
        }
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            HierarchyNode::Class(_) => 1,
            HierarchyNode::SuperClass(s) => s.leaf_count(),
        }
    }
}

impl From<TissueClass> for HierarchyNode {
    fn from(c: TissueClass) -> Self {
        HierarchyNode::Class(c)
    }
}

impl From<SuperClass> for HierarchyNode {
    fn from(s: SuperClass) -> Self {
        HierarchyNode::SuperClass(s)
    }
}
