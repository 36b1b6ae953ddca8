//! Interpolation over strided volumes.

pub mod linear;
pub mod nearest;
pub mod trait_;

pub use linear::LinearInterpolator;
pub use nearest::{nearest_offset, NearestNeighborInterpolator};
pub use trait_::{Interpolator, VoxelSource};

use serde::{Deserialize, Serialize};

/// Interpolation used when reading an atlas at a warped coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterpolationType {
    /// Registration is switched off; atlases are read in place.
    None,
    #[default]
    Linear,
    Nearest,
}

impl InterpolationType {
    /// Sample `source` at `p` with the selected interpolator.
    #[inline]
    pub fn sample<S: VoxelSource + ?Sized>(&self, source: &S, p: [f64; 3]) -> f64 {
        match self {
            InterpolationType::Linear => LinearInterpolator.sample(source, p),
            InterpolationType::Nearest | InterpolationType::None => {
                NearestNeighborInterpolator.sample(source, p)
            }
        }
    }
}
