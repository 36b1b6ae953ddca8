//! Flattened 3-D volumes with explicit strides.

pub mod buffer;
pub mod layout;
pub mod partition;
pub mod region;
pub mod scalar;

pub use buffer::Volume;
pub use layout::VolumeLayout;
pub use partition::{partition_box, BoxWalker, WalkedVoxel, WorkRange};
pub use region::{RegionBox, VoxelBox};
pub use scalar::{Scalar, ScalarType, ScalarVolume};
