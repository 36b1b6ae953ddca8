//! Tree-wide label assignment.

use crate::node::HierarchyNode;
use crate::superclass::SuperClass;

/// Give every superclass below and including `root` a fresh label.
///
/// Leaf labels are collected into a sorted unique list (ignoring `-1`);
/// superclasses are then visited in post-order and each receives
/// `max + 1`, which joins the list. Returns the final list.
pub fn assign_labels(root: &mut SuperClass) -> Vec<i32> {
    let mut labels = root.all_labels();
    assign_post_order(root, &mut labels);
    labels
}

fn assign_post_order(node: &mut SuperClass, labels: &mut Vec<i32>) {
    for child in node.children_mut().iter_mut().flatten() {
        if let HierarchyNode::SuperClass(sub) = child {
            assign_post_order(sub, labels);
        }
    }
    // 0 marks unsegmented voxels in the output, so never hand it out
    let next = labels.last().map_or(1, |&max| (max + 1).max(1));
    node.label = next;
    labels.push(next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::TissueClass;

    #[test]
    fn test_post_order_assignment() {
        let left = SuperClass::new("left")
            .with_child(TissueClass::new("a", 4, 1))
            .with_child(TissueClass::new("b", 9, 1));
        let right = SuperClass::new("right").with_child(TissueClass::new("c", 2, 1));
        let mut root = SuperClass::new("root")
            .with_child(left)
            .with_child(right)
            .with_child(TissueClass::new("d", -1, 1));
        let labels = assign_labels(&mut root);
        assert_eq!(labels, vec![2, 4, 9, 10, 11, 12]);
        assert_eq!(root.child(0).map(|n| n.label()), Some(10));
        assert_eq!(root.child(1).map(|n| n.label()), Some(11));
        assert_eq!(root.label, 12);
    }

    #[test]
    fn test_no_leaf_labels() {
        let mut root = SuperClass::new("root").with_child(TissueClass::new("a", -1, 1));
        assert_eq!(assign_labels(&mut root), vec![1]);
        assert_eq!(root.label, 1);
    }
}
