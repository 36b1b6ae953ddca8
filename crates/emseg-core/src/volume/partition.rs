//! Work partitions over a voxel box.
//!
//! Every parallel kernel splits its box into contiguous x-fastest ranges,
//! one per worker. Each range knows its first voxel coordinate, so no worker
//! depends on another worker's progress.

use super::region::VoxelBox;

/// A contiguous run of voxels inside a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRange {
    /// Linear index of the first voxel inside the box.
    pub first: usize,
    /// Number of voxels in the run.
    pub len: usize,
    /// Absolute coordinate of the first voxel.
    pub start: [usize; 3],
}

/// Split `region` into `workers` contiguous ranges.
///
/// Every worker but the last receives `count / workers` voxels; the last one
/// also takes the remainder.
pub fn partition_box(region: &VoxelBox, workers: usize) -> Vec<WorkRange> {
    let workers = workers.max(1);
    let total = region.voxel_count();
    let job = total / workers;
    let mut ranges = Vec::with_capacity(workers);
    let mut first = 0;
    for worker in 0..workers {
        let len = if worker + 1 < workers {
            job
        } else {
            total - job * (workers - 1)
        };
        let start = if first < total {
            region.coordinate(first)
        } else {
            region.max()
        };
        ranges.push(WorkRange { first, len, start });
        first += len;
    }
    ranges
}

/// Voxel visited by a [`BoxWalker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkedVoxel {
    /// Absolute coordinate.
    pub pos: [usize; 3],
    /// Linear index inside the walked box.
    pub local: usize,
}

/// Iterator over one [`WorkRange`] of a box, x fastest.
///
/// Encapsulates the row and slice wrap-around once so kernels only deal with
/// absolute coordinates and box-local indices.
#[derive(Debug, Clone)]
pub struct BoxWalker {
    region: VoxelBox,
    pos: [usize; 3],
    local: usize,
    remaining: usize,
}

impl BoxWalker {
    pub fn new(region: VoxelBox, range: WorkRange) -> Self {
        Self {
            region,
            pos: range.start,
            local: range.first,
            remaining: range.len,
        }
    }

    /// Walk the whole box.
    pub fn full(region: VoxelBox) -> Self {
        let range = WorkRange {
            first: 0,
            len: region.voxel_count(),
            start: region.min(),
        };
        Self::new(region, range)
    }
}

impl Iterator for BoxWalker {
    type Item = WalkedVoxel;

    fn next(&mut self) -> Option<WalkedVoxel> {
        if self.remaining == 0 {
            return None;
        }
        let item = WalkedVoxel {
            pos: self.pos,
            local: self.local,
        };
        self.remaining -= 1;
        self.local += 1;
        let min = self.region.min();
        let max = self.region.max();
        self.pos[0] += 1;
        if self.pos[0] > max[0] {
            self.pos[0] = min[0];
            self.pos[1] += 1;
            if self.pos[1] > max[1] {
                self.pos[1] = min[1];
                self.pos[2] += 1;
            }
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for BoxWalker {}
