use std::sync::Arc;

use half::{bf16, f16};

use crate::{CoreError, DType, Result};

/// Typed element buffer behind a [`Storage`].
#[derive(Debug, Clone)]
enum Buffer {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Backing storage for tensor data.
///
/// Cloning is cheap: clones share one buffer until one of them is written,
/// at which point the writer gets a private copy.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<Buffer>,
}

impl Storage {
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        let buffer = match dtype {
            DType::F16 => Buffer::F16(vec![f16::ZERO; numel]),
            DType::BF16 => Buffer::BF16(vec![bf16::ZERO; numel]),
            DType::F32 => Buffer::F32(vec![0.0; numel]),
            DType::F64 => Buffer::F64(vec![0.0; numel]),
        };
        Self {
            data: Arc::new(buffer),
        }
    }

    pub fn from_f32(data: &[f32]) -> Self {
        Self::from_vec(data.to_vec())
    }

    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            data: Arc::new(Buffer::F32(data)),
        }
    }

    /// Store `f32` values in `dtype`, rounding when the target is narrower.
    pub fn from_f32_as(data: &[f32], dtype: DType) -> Self {
        let buffer = match dtype {
            DType::F16 => Buffer::F16(data.iter().map(|&v| f16::from_f32(v)).collect()),
            DType::BF16 => Buffer::BF16(data.iter().map(|&v| bf16::from_f32(v)).collect()),
            DType::F32 => Buffer::F32(data.to_vec()),
            DType::F64 => Buffer::F64(data.iter().map(|&v| v as f64).collect()),
        };
        Self {
            data: Arc::new(buffer),
        }
    }

    pub fn dtype(&self) -> DType {
        match self.data.as_ref() {
            Buffer::F16(_) => DType::F16,
            Buffer::BF16(_) => DType::BF16,
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
        }
    }

    pub fn numel(&self) -> usize {
        match self.data.as_ref() {
            Buffer::F16(v) => v.len(),
            Buffer::BF16(v) => v.len(),
            Buffer::F32(v) => v.len(),
            Buffer::F64(v) => v.len(),
        }
    }

    /// Element `i` widened to `f32`.
    #[inline]
    pub fn get_f32(&self, i: usize) -> Option<f32> {
        match self.data.as_ref() {
            Buffer::F16(v) => v.get(i).map(|x| x.to_f32()),
            Buffer::BF16(v) => v.get(i).map(|x| x.to_f32()),
            Buffer::F32(v) => v.get(i).copied(),
            Buffer::F64(v) => v.get(i).map(|&x| x as f32),
        }
    }

    /// Write element `i`, rounding to the storage precision.
    /// Detaches from any other storage sharing this buffer.
    pub fn set_f32(&mut self, i: usize, value: f32) -> Result<()> {
        let numel = self.numel();
        let out_of_range = || CoreError::StorageError(format!("index {i} >= {numel}"));
        match Arc::make_mut(&mut self.data) {
            Buffer::F16(v) => *v.get_mut(i).ok_or_else(out_of_range)? = f16::from_f32(value),
            Buffer::BF16(v) => *v.get_mut(i).ok_or_else(out_of_range)? = bf16::from_f32(value),
            Buffer::F32(v) => *v.get_mut(i).ok_or_else(out_of_range)? = value,
            Buffer::F64(v) => *v.get_mut(i).ok_or_else(out_of_range)? = value as f64,
        }
        Ok(())
    }

    /// Every element widened to `f32`, in storage order.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.data.as_ref() {
            Buffer::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Buffer::BF16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Buffer::F32(v) => v.clone(),
            Buffer::F64(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Whether two storages point at the same buffer.
    pub fn shares_buffer(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
