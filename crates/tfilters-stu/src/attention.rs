//! Causal multi-head self-attention.

use rand::Rng;
use tfilters_core::{prefixed, prefixed_mut, CoreError, Module, Result, Tensor};

use crate::config::ModelConfig;
use crate::linear::Linear;

#[derive(Clone, Debug)]
pub struct Attention {
    /// QKV projection: (d, 3 * d)
    pub c_attn: Linear,
    /// Output projection: (d, d)
    pub c_proj: Linear,
    pub n_heads: usize,
    pub head_dim: usize,
}

impl Attention {
    pub fn new(config: &ModelConfig) -> Self {
        let d = config.n_embd;
        Self {
            c_attn: Linear::new(d, 3 * d, config.bias).with_dtype(config.torch_dtype),
            c_proj: Linear::new(d, d, config.bias)
                .with_dtype(config.torch_dtype)
                .with_scale_init(),
            n_heads: config.n_heads,
            head_dim: d / config.n_heads,
        }
    }

    /// Both projections are Xavier-normal.
    pub fn init_weights<R: Rng>(&mut self, rng: &mut R) {
        self.c_attn.init_xavier(rng);
        self.c_proj.init_xavier(rng);
    }
}

impl Module for Attention {
    /// (B, L, d) -> (B, L, d). Position `t` attends to positions `<= t`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.shape().expect_rank(3)?;
        let (batch, seq_len, dm) = (x.dims()[0], x.dims()[1], x.dims()[2]);
        if dm != self.n_heads * self.head_dim {
            return Err(CoreError::ShapeMismatch {
                expected: vec![batch, seq_len, self.n_heads * self.head_dim],
                got: x.dims().to_vec(),
            });
        }
        let (hd, nh) = (self.head_dim, self.n_heads);
        let qkv = self.c_attn.forward(x)?.to_f32_vec();

        let scale = 1.0 / (hd as f32).sqrt();
        let mut attn_out = vec![0.0f32; batch * seq_len * dm];
        let mut scores = vec![0.0f32; seq_len];

        for b in 0..batch {
            for h in 0..nh {
                let q_at = |t: usize, d: usize| qkv[(b * seq_len + t) * 3 * dm + h * hd + d];
                let k_at = |t: usize, d: usize| qkv[(b * seq_len + t) * 3 * dm + dm + h * hd + d];
                let v_at = |t: usize, d: usize| qkv[(b * seq_len + t) * 3 * dm + 2 * dm + h * hd + d];

                for qi in 0..seq_len {
                    let row = &mut scores[..=qi];
                    for (ki, s) in row.iter_mut().enumerate() {
                        *s = (0..hd).map(|d| q_at(qi, d) * k_at(ki, d)).sum::<f32>() * scale;
                    }
                    let max_val = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                    let mut sum = 0.0f32;
                    for s in row.iter_mut() {
                        *s = (*s - max_val).exp();
                        sum += *s;
                    }

                    for d in 0..hd {
                        let acc: f32 = row.iter().enumerate().map(|(ki, p)| p * v_at(ki, d)).sum();
                        attn_out[(b * seq_len + qi) * dm + h * hd + d] = acc / sum;
                    }
                }
            }
        }

        self.c_proj.forward(&Tensor::from_vec(attn_out, &[batch, seq_len, dm])?)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("c_attn", self.c_attn.named_parameters());
        params.extend(prefixed("c_proj", self.c_proj.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("c_attn", self.c_attn.named_parameters_mut());
        params.extend(prefixed_mut("c_proj", self.c_proj.named_parameters_mut()));
        params
    }
}
