//! Dense projection used by the MLP and attention blocks.

use rand::Rng;
use tfilters_core::{DType, Module, Result, Tensor};

/// `y = x @ W + b` with `W` stored as `(in_features, out_features)`.
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    /// Residual output projections get a depth-scaled init.
    pub scale_init: bool,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        Self {
            weight: Tensor::zeros(&[in_features, out_features], Default::default()),
            bias: bias.then(|| Tensor::zeros(&[out_features], Default::default())),
            scale_init: false,
        }
    }

    /// Store weight and bias in `dtype`. Init keeps whatever dtype is set.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.weight = self.weight.to_dtype(dtype);
        self.bias = self.bias.map(|b| b.to_dtype(dtype));
        self
    }

    /// Mark this layer as a residual output projection.
    pub fn with_scale_init(mut self) -> Self {
        self.scale_init = true;
        self
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Weight from `N(0, std^2)`, bias zeroed.
    pub fn init_normal<R: Rng>(&mut self, std: f32, rng: &mut R) {
        let dtype = self.weight.dtype();
        self.weight = Tensor::randn_with(self.weight.dims(), std, rng).to_dtype(dtype);
        self.zero_bias();
    }

    /// Xavier-normal weight, `std = sqrt(2 / (fan_in + fan_out))`, bias zeroed.
    pub fn init_xavier<R: Rng>(&mut self, rng: &mut R) {
        let std = (2.0 / (self.in_features() + self.out_features()) as f32).sqrt();
        self.init_normal(std, rng);
    }

    fn zero_bias(&mut self) {
        if let Some(b) = self.bias.as_mut() {
            *b = Tensor::zeros(b.dims(), b.dtype());
        }
    }
}

impl Module for Linear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.matmul(&self.weight)?;
        let Some(bias) = &self.bias else {
            return Ok(y);
        };
        let b = bias.to_f32_vec();
        let mut out = y.to_f32_vec();
        for row in out.chunks_exact_mut(b.len().max(1)) {
            for (o, v) in row.iter_mut().zip(&b) {
                *o += v;
            }
        }
        Tensor::from_vec(out, y.dims())
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![("weight".to_string(), &mut self.weight)];
        if let Some(b) = &mut self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }
}
