//! Voxel scalar types and type-erased volumes.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::buffer::Volume;
use super::layout::VolumeLayout;
use crate::spatial::Spacing;

/// Declared scalar type of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    U8,
    I16,
    U16,
    I32,
    F32,
    F64,
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::U8 => "unsigned char",
            ScalarType::I16 => "short",
            ScalarType::U16 => "unsigned short",
            ScalarType::I32 => "int",
            ScalarType::F32 => "float",
            ScalarType::F64 => "double",
        };
        f.write_str(name)
    }
}

/// Element types a [`Volume`] can hold.
pub trait Scalar: Copy + Default + Send + Sync + PartialOrd + fmt::Debug + 'static {
    const TYPE: ScalarType;

    fn to_f64(self) -> f64;

    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_scalar {
    ($t:ty, $variant:ident) => {
        impl Scalar for $t {
            const TYPE: ScalarType = ScalarType::$variant;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $t
            }
        }
    };
}

impl_scalar!(u8, U8);
impl_scalar!(i16, I16);
impl_scalar!(u16, U16);
impl_scalar!(i32, I32);
impl_scalar!(f32, F32);
impl_scalar!(f64, F64);

/// A volume whose element type is only known at runtime.
///
/// Probability atlases arrive in whatever type they were stored in; the
/// tree only requires that all atlases of one subtree share it.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarVolume {
    U8(Volume<u8>),
    I16(Volume<i16>),
    U16(Volume<u16>),
    I32(Volume<i32>),
    F32(Volume<f32>),
    F64(Volume<f64>),
}

macro_rules! dispatch {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            ScalarVolume::U8($v) => $body,
            ScalarVolume::I16($v) => $body,
            ScalarVolume::U16($v) => $body,
            ScalarVolume::I32($v) => $body,
            ScalarVolume::F32($v) => $body,
            ScalarVolume::F64($v) => $body,
        }
    };
}

impl ScalarVolume {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarVolume::U8(_) => ScalarType::U8,
            ScalarVolume::I16(_) => ScalarType::I16,
            ScalarVolume::U16(_) => ScalarType::U16,
            ScalarVolume::I32(_) => ScalarType::I32,
            ScalarVolume::F32(_) => ScalarType::F32,
            ScalarVolume::F64(_) => ScalarType::F64,
        }
    }

    pub fn layout(&self) -> &VolumeLayout {
        dispatch!(self, v => v.layout())
    }

    pub fn spacing(&self) -> Spacing {
        dispatch!(self, v => v.spacing())
    }

    pub fn dims(&self) -> [usize; 3] {
        self.layout().dims()
    }

    /// Value at a raw buffer offset, converted to `f64`.
    #[inline]
    pub fn value_at(&self, offset: usize) -> f64 {
        dispatch!(self, v => v.as_slice()[offset].to_f64())
    }

    /// Value at a voxel coordinate, converted to `f64`.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> f64 {
        self.value_at(self.layout().offset(x, y, z))
    }

    /// Copy into a contiguous `f64` volume.
    pub fn to_f64_volume(&self) -> Volume<f64> {
        dispatch!(self, v => v.map(|value| value.to_f64()))
    }
}

macro_rules! impl_from_volume {
    ($t:ty, $variant:ident) => {
        impl From<Volume<$t>> for ScalarVolume {
            fn from(volume: Volume<$t>) -> Self {
                ScalarVolume::$variant(volume)
            }
        }
    };
}

impl_from_volume!(u8, U8);
impl_from_volume!(i16, I16);
impl_from_volume!(u16, U16);
impl_from_volume!(i32, I32);
impl_from_volume!(f32, F32);
impl_from_volume!(f64, F64);
