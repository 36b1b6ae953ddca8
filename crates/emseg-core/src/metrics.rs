//! Overlap measures between label maps.

use crate::error::{Result, SegmentationError};
use crate::volume::{BoxWalker, Scalar, Volume, VoxelBox};

/// Dice overlap `2|A ∩ B| / (|A| + |B|)` of `label` in two label maps.
///
/// Only voxels inside `region` are counted (the whole volume when `None`).
/// Returns `-1.0` when the label is absent from both maps.
pub fn dice<T: Scalar>(
    a: &Volume<T>,
    b: &Volume<T>,
    label: T,
    region: Option<VoxelBox>,
) -> Result<f64> {
    if a.dims() != b.dims() {
        return Err(SegmentationError::ShapeMismatch {
            expected: a.dims().to_vec(),
            actual: b.dims().to_vec(),
        });
    }
    let full = VoxelBox::full(a.dims());
    let region = match region {
        Some(r) => r.intersect(&full).ok_or_else(|| {
            SegmentationError::input_mismatch("dice region lies outside the volume")
        })?,
        None => full,
    };

    let (mut in_a, mut in_b, mut both) = (0usize, 0usize, 0usize);
    for voxel in BoxWalker::full(region) {
        let [x, y, z] = voxel.pos;
        let ha = a.get(x, y, z) == label;
        let hb = b.get(x, y, z) == label;
        in_a += ha as usize;
        in_b += hb as usize;
        both += (ha && hb) as usize;
    }
    if in_a + in_b == 0 {
        return Ok(-1.0);
    }
    Ok(2.0 * both as f64 / (in_a + in_b) as f64)
}
