//! Spectral filter basis `phi`.
//!
//! The filters are the top eigenvectors of a fixed Hankel matrix, each scaled
//! by the fourth root of its eigenvalue. The basis depends only on the
//! sequence length, the filter count and the Hankel variant, so it is built
//! once and shared read-only by every STU layer.

use std::sync::Arc;

use nalgebra::DMatrix;
use tfilters_core::{DType, Storage, Tensor};
use tracing::debug;

use crate::error::{Result, StuError};

/// The `seq_len x seq_len` Hankel matrix whose eigenvectors form the filters.
///
/// With `s = i + j` over 1-based indices, the standard matrix is
/// `2 / (s^3 - s)`. The single-sign variant is
/// `((-1)^(s-2) + 1) * 8 / ((s + 3)(s - 1)(s + 1))`, which vanishes on odd `s`.
pub fn get_hankel(seq_len: usize, use_hankel_l: bool) -> DMatrix<f64> {
    DMatrix::from_fn(seq_len, seq_len, |i, j| {
        let s = (i + j + 2) as f64;
        if use_hankel_l {
            let sgn = if (i + j) % 2 == 0 { 2.0 } else { 0.0 };
            sgn * 8.0 / ((s + 3.0) * (s - 1.0) * (s + 1.0))
        } else {
            2.0 / (s * s * s - s)
        }
    })
}

/// Top-`k` spectral filters as a `(seq_len, k)` tensor in `dtype`.
///
/// Columns are ordered by ascending eigenvalue, so the last column holds
/// the dominant filter.
pub fn get_spectral_filters(
    seq_len: usize,
    k: usize,
    use_hankel_l: bool,
    dtype: DType,
) -> Result<Tensor> {
    if k == 0 || k > seq_len {
        return Err(StuError::InvalidConfig(format!(
            "cannot take {k} spectral filters from a sequence of length {seq_len}"
        )));
    }

    let eig = get_hankel(seq_len, use_hankel_l).symmetric_eigen();
    let mut order: Vec<usize> = (0..seq_len).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
    let top = &order[seq_len - k..];

    let mut data = vec![0.0f32; seq_len * k];
    for (col, &idx) in top.iter().enumerate() {
        // Eigenvalues of this PSD matrix can come back as tiny negatives.
        let scale = eig.eigenvalues[idx].max(0.0).powf(0.25);
        for row in 0..seq_len {
            data[row * k + col] = (eig.eigenvectors[(row, idx)] * scale) as f32;
        }
    }

    debug!(seq_len, k, use_hankel_l, %dtype, "computed spectral filters");
    Ok(Tensor::from_storage(
        Storage::from_f32_as(&data, dtype),
        [seq_len, k].into(),
    ))
}

/// A spectral basis shared by reference between layers.
#[derive(Clone, Debug)]
pub struct SpectralBasis {
    phi: Arc<Tensor>,
    use_hankel_l: bool,
}

impl SpectralBasis {
    /// Compute the basis for a sequence length and filter count.
    pub fn new(seq_len: usize, k: usize, use_hankel_l: bool, dtype: DType) -> Result<Self> {
        let phi = get_spectral_filters(seq_len, k, use_hankel_l, dtype)?;
        Ok(Self {
            phi: Arc::new(phi),
            use_hankel_l,
        })
    }

    /// Wrap an externally supplied `(seq_len, k)` basis.
    pub fn from_tensor(phi: Tensor, use_hankel_l: bool) -> Result<Self> {
        phi.shape().expect_rank(2)?;
        Ok(Self {
            phi: Arc::new(phi),
            use_hankel_l,
        })
    }

    /// Another handle to the same basis tensor.
    pub fn phi(&self) -> Arc<Tensor> {
        Arc::clone(&self.phi)
    }

    pub fn seq_len(&self) -> usize {
        self.phi.dims()[0]
    }

    pub fn num_filters(&self) -> usize {
        self.phi.dims()[1]
    }

    pub fn use_hankel_l(&self) -> bool {
        self.use_hankel_l
    }
}
