/// Per-voxel status inside the segmentation boundary of one level.
///
/// Ordered so that `status >= VoxelStatus::IncompleteModel` selects every
/// voxel the registration cost skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum VoxelStatus {
    #[default]
    Regular = 0,
    /// No class in scope has a non-zero prior here.
    IncompleteModel = 1,
    /// Not part of this level's region of interest.
    OutsideRoi = 2,
}

impl VoxelStatus {
    pub fn in_roi(self) -> bool {
        self != VoxelStatus::OutsideRoi
    }

    pub fn skips_registration(self) -> bool {
        self >= VoxelStatus::IncompleteModel
    }
}
