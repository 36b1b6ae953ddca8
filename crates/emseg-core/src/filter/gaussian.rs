use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SegmentationError};

/// Separable Gaussian smoothing over a dense box buffer.
///
/// The kernel is sampled on `width` integer taps centred on zero and
/// normalised to unit sum. Voxels beyond the box edge count as zero, so
/// smoothing a weight buffer and a weighted residual with the same kernel
/// and dividing the two yields a normalised local average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianSmoother {
    width: usize,
    sigma: f64,
}

impl GaussianSmoother {
    /// Create a smoother with an odd kernel `width` and standard deviation
    /// `sigma`, both in voxels.
    pub fn new(width: usize, sigma: f64) -> Result<Self> {
        if width == 0 || width % 2 == 0 {
            return Err(SegmentationError::invalid_configuration(format!(
                "smoothing width must be odd and positive, got {}",
                width
            )));
        }
        if !(sigma > 0.0) {
            return Err(SegmentationError::invalid_configuration(format!(
                "smoothing sigma must be positive, got {}",
                sigma
            )));
        }
        Ok(Self { width, sigma })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Normalised kernel taps.
    pub fn kernel(&self) -> Vec<f64> {
        let radius = (self.width / 2) as f64;
        let two_sigma2 = 2.0 * self.sigma * self.sigma;
        let mut kernel: Vec<f64> = (0..self.width)
            .map(|i| {
                let x = i as f64 - radius;
                (-x * x / two_sigma2).exp()
            })
            .collect();
        let sum: f64 = kernel.iter().sum();
        for v in &mut kernel {
            *v /= sum;
        }
        kernel
    }

    /// Smooth `data`, laid out x fastest with extent `dims`, in place.
    ///
    /// Axes of length one are left untouched. Runs on the ambient rayon
    /// pool, so callers wrap it in `pool.install` to bound the workers.
    pub fn smooth(&self, data: &mut [f64], dims: [usize; 3]) -> Result<()> {
        let count = dims[0] * dims[1] * dims[2];
        if data.len() != count {
            return Err(SegmentationError::ShapeMismatch {
                expected: vec![count],
                actual: vec![data.len()],
            });
        }
        let kernel = self.kernel();
        let strides = [1, dims[0], dims[0] * dims[1]];
        let mut scratch = vec![0.0; count];
        for axis in 0..3 {
            if dims[axis] < 2 {
                continue;
            }
            convolve_axis(data, &mut scratch, dims, strides, axis, &kernel);
            data.copy_from_slice(&scratch);
        }
        Ok(())
    }
}

fn convolve_axis(
    input: &[f64],
    output: &mut [f64],
    dims: [usize; 3],
    strides: [usize; 3],
    axis: usize,
    kernel: &[f64],
) {
    let radius = (kernel.len() / 2) as i64;
    let len = dims[axis] as i64;
    let stride = strides[axis];
    output.par_iter_mut().enumerate().for_each(|(index, out)| {
        let pos = ((index / stride) % dims[axis]) as i64;
        let line_start = index - pos as usize * stride;
        let lo = (pos - radius).max(0);
        let hi = (pos + radius).min(len - 1);
        let mut acc = 0.0;
        for j in lo..=hi {
            acc += kernel[(j - pos + radius) as usize] * input[line_start + j as usize * stride];
        }
        *out = acc;
    });
}
