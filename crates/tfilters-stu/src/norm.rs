//! RMSNorm with a probed kernel backend.
//!
//! `y = x / sqrt(mean(x^2) + eps) * weight`, normalised over the last axis.

use tfilters_core::{CoreError, DType, Module, Result, Tensor};
use tracing::warn;

/// Which implementation a norm layer runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormKernel {
    /// Single pass per row with split accumulators.
    Fused,
    /// Plain two-pass loop.
    Reference,
}

impl NormKernel {
    pub fn is_fused_available() -> bool {
        cfg!(feature = "fused-norm")
    }

    /// Resolve the backend once. Asking for the fused kernel when it is not
    /// compiled in falls back to the reference loop.
    pub fn probe(use_fused: bool) -> Self {
        match (use_fused, Self::is_fused_available()) {
            (true, true) => NormKernel::Fused,
            (true, false) => {
                warn!("fused RMSNorm kernel unavailable, using reference implementation");
                NormKernel::Reference
            }
            (false, _) => NormKernel::Reference,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RmsNorm {
    /// Learnable scale: shape (d,)
    pub weight: Tensor,
    pub eps: f32,
    kernel: NormKernel,
}

impl RmsNorm {
    pub fn new(d: usize, eps: f32, kernel: NormKernel) -> Self {
        Self {
            weight: Tensor::ones(&[d]),
            eps,
            kernel,
        }
    }

    /// Store the scale in `dtype`.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.weight = self.weight.to_dtype(dtype);
        self
    }

    pub fn kernel(&self) -> NormKernel {
        self.kernel
    }

    fn reference_row(&self, x: &[f32], w: &[f32], out: &mut [f32]) {
        let ms = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
        let inv_rms = 1.0 / (ms + self.eps).sqrt();
        for ((o, &v), &g) in out.iter_mut().zip(x).zip(w) {
            *o = v * inv_rms * g;
        }
    }

    fn fused_row(&self, x: &[f32], w: &[f32], out: &mut [f32]) {
        let mut lanes = [0.0f32; 4];
        let chunks = x.chunks_exact(4);
        let tail = chunks.remainder();
        for c in chunks {
            for (acc, v) in lanes.iter_mut().zip(c) {
                *acc += v * v;
            }
        }
        let ms = (lanes.iter().sum::<f32>() + tail.iter().map(|v| v * v).sum::<f32>())
            / x.len() as f32;
        let inv_rms = 1.0 / (ms + self.eps).sqrt();
        for ((o, &v), &g) in out.iter_mut().zip(x).zip(w) {
            *o = v * inv_rms * g;
        }
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let d = self.weight.numel();
        if x.ndim() == 0 {
            return Err(CoreError::RankMismatch {
                expected: 1,
                got: vec![],
            });
        }
        if x.shape().last_dim() != d {
            let mut expected = x.dims().to_vec();
            if let Some(last) = expected.last_mut() {
                *last = d;
            }
            return Err(CoreError::ShapeMismatch {
                expected,
                got: x.dims().to_vec(),
            });
        }

        let w = self.weight.to_f32_vec();
        let input = x.to_f32_vec();
        let mut out = vec![0.0f32; input.len()];
        for (row, out_row) in input.chunks_exact(d).zip(out.chunks_exact_mut(d)) {
            match self.kernel {
                NormKernel::Fused => self.fused_row(row, &w, out_row),
                NormKernel::Reference => self.reference_row(row, &w, out_row),
            }
        }
        let y = Tensor::from_vec(out, x.dims())?;
        Ok(match x.dtype() {
            DType::F32 => y,
            dtype => y.to_dtype(dtype),
        })
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        vec![("weight".to_string(), &self.weight)]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![("weight".to_string(), &mut self.weight)]
    }
}
