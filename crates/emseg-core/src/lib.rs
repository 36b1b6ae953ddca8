//! Volumes, spatial transforms, interpolation and the worker pool shared by
//! the segmentation crates.
//!
//! Volumes are strided so that a segmentation box can be viewed in place
//! without copying the surrounding image.

pub mod error;
pub mod spatial;
pub mod volume;
pub mod transform;
pub mod interpolation;
pub mod filter;
pub mod image;
pub mod metrics;
pub mod pool;

pub use error::{Result, SegmentationError};
pub use spatial::Spacing;
pub use volume::{
    partition_box, BoxWalker, RegionBox, Scalar, ScalarType, ScalarVolume, Volume, VolumeLayout,
    VoxelBox, WorkRange,
};
pub use transform::{AffineMatrix, ParameterLayout};
pub use interpolation::{InterpolationType, Interpolator, VoxelSource};
pub use filter::GaussianSmoother;
pub use metrics::dice;
pub use pool::build_worker_pool;
