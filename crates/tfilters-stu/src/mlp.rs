use rand::Rng;
use tfilters_core::{prefixed, prefixed_mut, Module, Result, Tensor};

use crate::config::ModelConfig;
use crate::linear::Linear;

/// GELU activation (tanh approximation).
#[inline]
pub(crate) fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (0.797_884_6 * (x + 0.044715 * x * x * x)).tanh())
}

/// Position-wise feed-forward: `fc1 -> GELU -> fc2`.
#[derive(Clone, Debug)]
pub struct Mlp {
    pub fc1: Linear,
    pub fc2: Linear,
}

impl Mlp {
    pub fn new(config: &ModelConfig) -> Self {
        let hidden = config.mlp_scale * config.n_embd;
        Self {
            fc1: Linear::new(config.n_embd, hidden, config.bias).with_dtype(config.torch_dtype),
            fc2: Linear::new(hidden, config.n_embd, config.bias)
                .with_dtype(config.torch_dtype)
                .with_scale_init(),
        }
    }

    /// `std` for plain projections, `scaled_std` for `SCALE_INIT` ones.
    pub fn init_weights<R: Rng>(&mut self, std: f32, scaled_std: f32, rng: &mut R) {
        for lin in [&mut self.fc1, &mut self.fc2] {
            let s = if lin.scale_init { scaled_std } else { std };
            lin.init_normal(s, rng);
        }
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(x)?;
        let act: Vec<f32> = h.to_f32_vec().into_iter().map(gelu).collect();
        self.fc2.forward(&Tensor::from_vec(act, h.dims())?)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("fc1", self.fc1.named_parameters());
        params.extend(prefixed("fc2", self.fc2.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("fc1", self.fc1.named_parameters_mut());
        params.extend(prefixed_mut("fc2", self.fc2.named_parameters_mut()));
        params
    }
}
