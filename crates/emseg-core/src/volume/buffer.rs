//! Owned strided volume buffer.

use crate::error::{Result, SegmentationError};
use crate::spatial::Spacing;

use super::layout::VolumeLayout;
use super::region::VoxelBox;

/// Owned contiguous buffer plus an explicit stride descriptor.
///
/// Element `(x, y, z)` lives at `layout.offset(x, y, z)`. Padding elements
/// (when `inc_y`/`inc_z` are non-zero) are carried but never interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T> {
    data: Vec<T>,
    layout: VolumeLayout,
    spacing: Spacing,
}

impl<T: Copy> Volume<T> {
    /// Create a contiguous volume filled with `value`.
    pub fn filled(dims: [usize; 3], value: T) -> Self {
        let layout = VolumeLayout::new(dims);
        Self {
            data: vec![value; layout.buffer_len()],
            layout,
            spacing: Spacing::default(),
        }
    }

    /// Wrap an x-fastest buffer without padding.
    pub fn from_vec(dims: [usize; 3], data: Vec<T>) -> Result<Self> {
        Self::with_layout(VolumeLayout::new(dims), data)
    }

    /// Wrap a buffer with an explicit layout.
    pub fn with_layout(layout: VolumeLayout, data: Vec<T>) -> Result<Self> {
        if data.len() < layout.buffer_len() {
            return Err(SegmentationError::ShapeMismatch {
                expected: vec![layout.buffer_len()],
                actual: vec![data.len()],
            });
        }
        Ok(Self {
            data,
            layout,
            spacing: Spacing::default(),
        })
    }

    /// Build a contiguous volume from a function of the voxel coordinate.
    pub fn from_fn(dims: [usize; 3], mut f: impl FnMut(usize, usize, usize) -> T) -> Self {
        let layout = VolumeLayout::new(dims);
        let mut data = Vec::with_capacity(layout.buffer_len());
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    data.push(f(x, y, z));
                }
            }
        }
        Self {
            data,
            layout,
            spacing: Spacing::default(),
        }
    }

    /// Set the voxel spacing.
    pub fn with_spacing(mut self, spacing: Spacing) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn layout(&self) -> &VolumeLayout {
        &self.layout
    }

    pub fn dims(&self) -> [usize; 3] {
        self.layout.dims()
    }

    pub fn spacing(&self) -> Spacing {
        self.spacing
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> T {
        self.data[self.layout.offset(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: T) {
        let offset = self.layout.offset(x, y, z);
        self.data[offset] = value;
    }

    /// Fill every element, padding included.
    pub fn fill(&mut self, value: T) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// Element-wise conversion into a contiguous volume.
    pub fn map<U: Copy>(&self, mut f: impl FnMut(T) -> U) -> Volume<U> {
        let dims = self.dims();
        let mut data = Vec::with_capacity(self.layout.voxel_count());
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                let row = self.layout.offset(0, y, z);
                data.extend(self.data[row..row + dims[0]].iter().map(|v| f(*v)));
            }
        }
        Volume {
            data,
            layout: VolumeLayout::new(dims),
            spacing: self.spacing,
        }
    }

    /// Copy the voxels of `region` into a contiguous buffer (x fastest).
    pub fn extract(&self, region: &VoxelBox) -> Vec<T> {
        let min = region.min();
        let max = region.max();
        let mut out = Vec::with_capacity(region.voxel_count());
        for z in min[2]..=max[2] {
            for y in min[1]..=max[1] {
                let row = self.layout.offset(min[0], y, z);
                out.extend_from_slice(&self.data[row..row + (max[0] - min[0] + 1)]);
            }
        }
        out
    }

    /// Write a contiguous region buffer back into the volume.
    pub fn insert(&mut self, region: &VoxelBox, values: &[T]) -> Result<()> {
        if values.len() != region.voxel_count() {
            return Err(SegmentationError::ShapeMismatch {
                expected: vec![region.voxel_count()],
                actual: vec![values.len()],
            });
        }
        let min = region.min();
        let max = region.max();
        let row_len = max[0] - min[0] + 1;
        let mut index = 0;
        for z in min[2]..=max[2] {
            for y in min[1]..=max[1] {
                let row = self.layout.offset(min[0], y, z);
                self.data[row..row + row_len].copy_from_slice(&values[index..index + row_len]);
                index += row_len;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_and_get() {
        let v = Volume::from_vec([2, 2, 2], (0..8).collect::<Vec<i32>>()).unwrap();
        assert_eq!(v.get(1, 0, 0), 1);
        assert_eq!(v.get(0, 1, 0), 2);
        assert_eq!(v.get(1, 1, 1), 7);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let err = Volume::from_vec([2, 2, 2], vec![0u8; 7]).unwrap_err();
        assert!(matches!(err, SegmentationError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_padded_layout_map_drops_padding() {
        let layout = VolumeLayout::with_padding([2, 2, 1], 1, 0);
        // rows: [a b pad] [c d pad]
        let v = Volume::with_layout(layout, vec![1.0f32, 2.0, -1.0, 3.0, 4.0, -1.0]).unwrap();
        assert_eq!(v.get(1, 1, 0), 4.0);
        let contiguous = v.map(|x| x as f64);
        assert_eq!(contiguous.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_extract_insert() {
        let mut v = Volume::from_fn([4, 4, 2], |x, y, z| (x + 10 * y + 100 * z) as i32);
        let region = VoxelBox::new([1, 1, 1], [2, 2, 1]);
        let block = v.extract(&region);
        assert_eq!(block, vec![111, 112, 121, 122]);
        v.insert(&region, &[0, 0, 0, 0]).unwrap();
        assert_eq!(v.get(2, 2, 1), 0);
        assert_eq!(v.get(3, 2, 1), 123);
    }
}
