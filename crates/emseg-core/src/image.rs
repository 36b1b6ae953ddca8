//! Conversion between `burn` tensors and strided volumes.
//!
//! Tensors are laid out `[Z, Y, X]`, which matches the x-fastest order of a
//! contiguous [`Volume`].

use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor, TensorData};

use crate::error::{Result, SegmentationError};
use crate::spatial::Spacing;
use crate::volume::Volume;

impl Volume<f32> {
    /// Build a contiguous volume from a `[Z, Y, X]` tensor.
    pub fn from_tensor<B: Backend>(tensor: &Tensor<B, 3>, spacing: Spacing) -> Result<Self> {
        let [nz, ny, nx] = tensor.dims();
        let data = tensor
            .clone()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| {
                SegmentationError::input_mismatch(format!("unreadable tensor data: {:?}", e))
            })?;
        Ok(Volume::from_vec([nx, ny, nz], data)?.with_spacing(spacing))
    }

    /// Copy the voxels into a `[Z, Y, X]` tensor on `device`.
    ///
    /// Padding of a non-contiguous layout is dropped.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        let [nx, ny, nz] = self.dims();
        let values = if self.layout().is_contiguous() {
            self.as_slice().to_vec()
        } else {
            self.map(|v| v).into_vec()
        };
        Tensor::from_data(TensorData::new(values, Shape::new([nz, ny, nx])), device)
    }
}
