//! Tensor arithmetic used by the spectral layers.
//!
//! All operations compute in f32 and return new contiguous f32 tensors.

use crate::{CoreError, Result, Tensor};

impl Tensor {
    /// `(..., k) @ (k, n) -> (..., n)`.
    ///
    /// The left operand may have any leading batch axes; the right operand
    /// must be a matrix.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        rhs.shape().expect_rank(2)?;
        if self.ndim() == 0 {
            return Err(CoreError::RankMismatch {
                expected: 1,
                got: vec![],
            });
        }
        let k = self.shape().last_dim();
        let (k2, n) = (rhs.dims()[0], rhs.dims()[1]);
        let m = self.numel() / k.max(1);
        if k != k2 {
            return Err(CoreError::MatmulDimMismatch { m, k1: k, k2, n });
        }

        let a = self.to_f32_vec();
        let b = rhs.to_f32_vec();
        let mut out = vec![0.0f32; m * n];
        for (row, out_row) in out.chunks_exact_mut(n.max(1)).enumerate().take(m) {
            let a_row = &a[row * k..(row + 1) * k];
            for (p, &a_val) in a_row.iter().enumerate() {
                if a_val == 0.0 {
                    continue;
                }
                let b_row = &b[p * n..(p + 1) * n];
                for (o, &b_val) in out_row.iter_mut().zip(b_row) {
                    *o += a_val * b_val;
                }
            }
        }

        let mut dims = self.dims().to_vec();
        if let Some(last) = dims.last_mut() {
            *last = n;
        }
        Tensor::from_vec(out, &dims)
    }

    /// Elementwise sum of two tensors of identical shape.
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        if self.shape() != rhs.shape() {
            return Err(CoreError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: rhs.dims().to_vec(),
            });
        }
        let b = rhs.to_f32_vec();
        let out = self
            .to_f32_vec()
            .into_iter()
            .zip(b)
            .map(|(x, y)| x + y)
            .collect();
        Tensor::from_vec(out, self.dims())
    }

    /// Largest absolute elementwise difference.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f32> {
        if self.shape() != other.shape() {
            return Err(CoreError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: other.dims().to_vec(),
            });
        }
        Ok(self
            .to_f32_vec()
            .iter()
            .zip(other.to_f32_vec().iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max))
    }

    /// `|a - b| <= atol + rtol * |b|` for every element.
    /// Tensors of different shapes are never close.
    pub fn allclose(&self, other: &Tensor, rtol: f32, atol: f32) -> bool {
        if self.shape() != other.shape() {
            return false;
        }
        self.to_f32_vec()
            .iter()
            .zip(other.to_f32_vec().iter())
            .all(|(a, b)| (a - b).abs() <= atol + rtol * b.abs())
    }

    /// Sum of all elements.
    pub fn sum_all(&self) -> f32 {
        self.to_f32_vec().iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use crate::{DType, Tensor};
    use approx::assert_relative_eq;

    #[test]
    fn test_matmul_batched_lhs() {
        // (2, 1, 2) @ (2, 3)
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 1, 2]);
        let b = Tensor::from_f32(&[1.0, 0.0, 1.0, 0.0, 1.0, 1.0], &[2, 3]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.dims(), &[2, 1, 3]);
        assert_eq!(c.to_f32_vec(), vec![1.0, 2.0, 3.0, 3.0, 4.0, 7.0]);
    }

    #[test]
    fn test_matmul_dim_mismatch() {
        let a = Tensor::ones(&[2, 3]);
        let b = Tensor::ones(&[2, 3]);
        assert!(a.matmul(&b).is_err());
    }

    #[test]
    fn test_matmul_reads_reduced_precision() {
        let a = Tensor::ones(&[1, 2]).to_dtype(DType::BF16);
        let b = Tensor::full(&[2, 1], 0.5);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.dtype(), DType::F32);
        assert_relative_eq!(c.get(&[0, 0]).unwrap(), 1.0);
    }

    #[test]
    fn test_add_and_allclose() {
        let a = Tensor::full(&[3], 1.0);
        let b = Tensor::full(&[3], 2.0);
        let c = a.add(&b).unwrap();
        assert!(c.allclose(&Tensor::full(&[3], 3.0), 0.0, 1e-6));
        assert!(!c.allclose(&Tensor::full(&[4], 3.0), 0.0, 1e-6));
        assert!(a.add(&Tensor::ones(&[4])).is_err());
        assert_relative_eq!(c.max_abs_diff(&a).unwrap(), 2.0);
    }
}
