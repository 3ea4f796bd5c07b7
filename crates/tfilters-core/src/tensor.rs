use std::fmt;

use rand::Rng;
use smallvec::SmallVec;

use crate::dtype::DType;
use crate::error::CoreError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// A multi-dimensional array over shared storage.
///
/// CPU-only, no autograd. Views (permute, transpose) share storage
/// with the tensor they came from; writes copy the buffer first if it is
/// shared, so a view never observes a write made through another handle.
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    strides: SmallVec<[usize; 4]>,
}

impl Tensor {
    /// Copy `data` into a new f32 tensor.
    ///
    /// Panics on a length mismatch; [`Tensor::from_vec`] reports it instead.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "{:?} holds {} elements, data has {}",
            shape,
            s.numel(),
            data.len()
        );
        Self::from_storage(Storage::from_f32(data), s)
    }

    /// Take ownership of `data` as a tensor of the given shape.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(CoreError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self::from_storage(Storage::from_vec(data), s))
    }

    /// Zero-filled tensor in `dtype`.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        Self::from_storage(Storage::zeros(dtype, s.numel()), s)
    }

    /// Allocate a tensor whose contents are not meaningful until an
    /// initialisation policy writes them.
    pub fn empty(shape: &[usize], dtype: DType) -> Self {
        Self::zeros(shape, dtype)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let s = Shape::new(shape);
        let numel = s.numel();
        Self::from_storage(Storage::from_vec(vec![value; numel]), s)
    }

    /// Standard normal draws from the thread-local generator.
    pub fn randn(shape: &[usize]) -> Self {
        Self::randn_with(shape, 1.0, &mut rand::thread_rng())
    }

    /// Draw from N(0, std²) with a caller-supplied generator (Box-Muller).
    pub fn randn_with<R: Rng>(shape: &[usize], std: f32, rng: &mut R) -> Self {
        let s = Shape::new(shape);
        let data: Vec<f32> = (0..s.numel())
            .map(|_| {
                let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
                let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
                std * (-2.0f32 * u1.ln()).sqrt() * u2.cos()
            })
            .collect();
        Self::from_storage(Storage::from_vec(data), s)
    }

    /// Row-major view over the whole of `storage`.
    pub fn from_storage(storage: Storage, shape: Shape) -> Self {
        let strides = shape.contiguous_strides();
        Self {
            storage,
            shape,
            strides,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Storage order is logical order.
    pub fn is_contiguous(&self) -> bool {
        self.strides == self.shape.contiguous_strides()
    }

    /// Whether `self` and `other` read the same buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        self.storage.shares_buffer(&other.storage)
    }

    /// All elements in logical (row-major) order, widened to f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        if self.is_contiguous() {
            return self.storage.to_f32_vec();
        }
        (0..self.numel())
            .filter_map(|i| self.storage.get_f32(self.flat_to_physical(i)))
            .collect()
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        let physical = self.physical_index(index)?;
        self.storage
            .get_f32(physical)
            .ok_or_else(|| self.out_of_bounds(index))
    }

    /// Write the element at a multi-dimensional index.
    pub fn set(&mut self, index: &[usize], value: f32) -> Result<()> {
        let physical = self.physical_index(index)?;
        self.storage.set_f32(physical, value)
    }

    fn physical_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.ndim() || index.iter().zip(self.dims()).any(|(&i, &d)| i >= d) {
            return Err(self.out_of_bounds(index));
        }
        Ok(index
            .iter()
            .zip(self.strides.iter())
            .map(|(&i, &s)| i * s)
            .sum())
    }

    fn out_of_bounds(&self, index: &[usize]) -> CoreError {
        CoreError::IndexOutOfBounds {
            index: index.to_vec(),
            shape: self.dims().to_vec(),
        }
    }

    fn flat_to_physical(&self, flat_index: usize) -> usize {
        let mut remaining = flat_index;
        let mut physical = 0;
        for (cs, &stride) in self.shape.contiguous_strides().iter().zip(self.strides.iter()) {
            physical += (remaining / cs) * stride;
            remaining %= cs;
        }
        physical
    }

    /// Copy into a contiguous tensor of `dtype`, rounding when narrowing.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        if dtype == self.dtype() && self.is_contiguous() {
            return self.clone();
        }
        let values = self.to_f32_vec();
        Tensor::from_storage(Storage::from_f32_as(&values, dtype), self.shape.clone())
    }

    /// Reorder axes without copying.
    pub fn permute(&self, perm: &[usize]) -> Result<Tensor> {
        let shape = self.shape.permute(perm)?;
        let strides = perm.iter().map(|&p| self.strides[p]).collect();
        Ok(Tensor {
            storage: self.storage.clone(),
            shape,
            strides,
        })
    }

    /// Swap the last two axes.
    pub fn transpose(&self) -> Result<Tensor> {
        let ndim = self.ndim();
        if ndim < 2 {
            return Err(CoreError::InvalidAxis { axis: 1, ndim });
        }
        let mut perm: SmallVec<[usize; 4]> = (0..ndim).collect();
        perm.swap(ndim - 2, ndim - 1);
        self.permute(&perm)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, contiguous={})",
            self.shape,
            self.dtype(),
            self.is_contiguous(),
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.to_f32_vec();
        match data.as_slice() {
            [first, second, .., last] if data.len() > 16 => {
                write!(f, "[{first:.4}, {second:.4}, ..., {last:.4}] {}", self.shape)
            }
            _ => write!(f, "{data:?} {}", self.shape),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_from_vec_checks_len() {
        assert!(Tensor::from_vec(vec![1.0; 6], &[2, 3]).is_ok());
        assert!(matches!(
            Tensor::from_vec(vec![1.0; 5], &[2, 3]),
            Err(CoreError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_permute_view_reads_through() {
        let t = Tensor::from_f32(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], &[2, 3]);
        let p = t.permute(&[1, 0]).unwrap();
        assert_eq!(p.dims(), &[3, 2]);
        assert!(!p.is_contiguous());
        assert_eq!(p.get(&[2, 1]).unwrap(), 5.0);
        assert_eq!(p.to_f32_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(p.shares_storage(&t));
    }

    #[test]
    fn test_transpose_last_two_axes() {
        let t = Tensor::from_f32(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], &[2, 2, 2]);
        let tt = t.transpose().unwrap();
        assert_eq!(tt.dims(), &[2, 2, 2]);
        assert_eq!(tt.to_f32_vec(), vec![0.0, 2.0, 1.0, 3.0, 4.0, 6.0, 5.0, 7.0]);
        assert!(Tensor::from_f32(&[1.0], &[1]).transpose().is_err());
    }

    #[test]
    fn test_set_detaches_clone() {
        let a = Tensor::zeros(&[2, 2], DType::F32);
        let mut b = a.clone();
        b.set(&[1, 1], 3.0).unwrap();
        assert_eq!(a.get(&[1, 1]).unwrap(), 0.0);
        assert_eq!(b.get(&[1, 1]).unwrap(), 3.0);
        assert!(b.set(&[2, 0], 1.0).is_err());
    }

    #[test]
    fn test_to_dtype_bf16() {
        let t = Tensor::from_f32(&[0.1, 1.0], &[2]);
        let h = t.to_dtype(DType::BF16);
        assert_eq!(h.dtype(), DType::BF16);
        assert!((h.get(&[0]).unwrap() - 0.1).abs() < 1e-3);
        assert_eq!(h.get(&[1]).unwrap(), 1.0);
    }

    #[test]
    fn test_randn_seeded_is_reproducible() {
        let a = Tensor::randn_with(&[16], 0.5, &mut StdRng::seed_from_u64(7));
        let b = Tensor::randn_with(&[16], 0.5, &mut StdRng::seed_from_u64(7));
        assert_eq!(a.to_f32_vec(), b.to_f32_vec());
        assert!(a.to_f32_vec().iter().all(|v| v.is_finite()));
    }
}
