//! Transformer backbone: token embedding, stacked STU and attention blocks, tied LM head.
//!
//! Embedding → dropout → N × Layer → Final RMSNorm → `h @ W_emb^T`.
//!
//! The token embedding and the output projection are one tensor. There is
//! no separate head weight to keep in sync; both accessors return the same
//! field.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tfilters_core::{prefixed, prefixed_mut, CoreError, Module, Tensor};
use tracing::{debug, info};

use crate::config::{LayerKind, ModelConfig};
use crate::error::{Result, StuError};
use crate::layers::{AttentionLayer, Layer, StuLayer};
use crate::norm::{NormKernel, RmsNorm};
use crate::spectral::SpectralBasis;

pub struct Transformer {
    pub config: ModelConfig,
    basis: SpectralBasis,
    /// Token embedding, also the LM head: (vocab_size, n_embd)
    tok_emb: Tensor,
    lm_head_bias: Option<Tensor>,
    pub layers: Vec<Layer>,
    pub norm: RmsNorm,
    training: bool,
}

impl Transformer {
    /// Build and initialise a model with a fresh random seed.
    pub fn new(config: ModelConfig) -> Result<Self> {
        Self::with_rng(config, &mut StdRng::from_entropy())
    }

    /// Build and initialise a model, drawing every weight from `rng`.
    pub fn with_rng<R: Rng>(config: ModelConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let n = config.padded_len();
        let basis = SpectralBasis::new(
            config.seq_len,
            config.num_filters(),
            config.use_hankel_l,
            config.torch_dtype,
        )?;
        let kernel = NormKernel::probe(config.use_fused_norm);

        let layers = (0..config.n_layers)
            .map(|i| -> Result<Layer> {
                Ok(match config.layer_pattern.kind_at(i) {
                    LayerKind::Stu => Layer::Stu(StuLayer::new(&config, basis.phi(), n, kernel)?),
                    LayerKind::Attention => Layer::Attention(AttentionLayer::new(&config, kernel)),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let d = config.n_embd;
        let dtype = config.torch_dtype;
        let mut model = Self {
            tok_emb: Tensor::zeros(&[config.vocab_size, d], dtype),
            lm_head_bias: config.bias.then(|| Tensor::zeros(&[config.vocab_size], dtype)),
            norm: RmsNorm::new(d, config.norm_eps, kernel).with_dtype(dtype),
            basis,
            layers,
            training: false,
            config,
        };
        model.init_weights(rng);
        info!(
            params = model.num_params(),
            layers = model.layers.len(),
            n,
            "built spectral transformer"
        );
        Ok(model)
    }

    /// Initialise every weight.
    ///
    /// Linear weights draw from `N(0, n_embd^-0.5)`; residual output
    /// projections are further scaled by `(2 * n_layers)^-0.5`. Attention
    /// projections are Xavier-normal, biases are zero, norms are one.
    pub fn init_weights<R: Rng>(&mut self, rng: &mut R) {
        let std = (self.config.n_embd as f32).powf(-0.5);
        let scaled_std = std * (2.0 * self.config.n_layers.max(1) as f32).powf(-0.5);
        debug!(std, scaled_std, "initialising weights");

        for layer in &mut self.layers {
            layer.mlp_mut().init_weights(std, scaled_std, rng);
            match layer {
                Layer::Stu(l) => l.stu.init_weights(std, rng),
                Layer::Attention(l) => l.attn.init_weights(rng),
            }
        }
        self.tok_emb =
            Tensor::randn_with(self.tok_emb.dims(), std, rng).to_dtype(self.tok_emb.dtype());
        if let Some(b) = self.lm_head_bias.as_mut() {
            *b = Tensor::zeros(b.dims(), b.dtype());
        }
    }

    pub fn spectral_basis(&self) -> &SpectralBasis {
        &self.basis
    }

    pub fn embedding_weight(&self) -> &Tensor {
        &self.tok_emb
    }

    pub fn embedding_weight_mut(&mut self) -> &mut Tensor {
        &mut self.tok_emb
    }

    /// The output projection. Same tensor as [`Self::embedding_weight`].
    pub fn lm_head_weight(&self) -> &Tensor {
        &self.tok_emb
    }

    pub fn lm_head_weight_mut(&mut self) -> &mut Tensor {
        &mut self.tok_emb
    }

    pub fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Every trainable tensor once. The tied embedding appears only as
    /// `tok_emb.weight`.
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("tok_emb.weight".to_string(), &self.tok_emb)];
        for (i, layer) in self.layers.iter().enumerate() {
            params.extend(prefixed(&format!("layers.{i}"), layer.named_parameters()));
        }
        params.extend(prefixed("norm", self.norm.named_parameters()));
        if let Some(b) = &self.lm_head_bias {
            params.push(("lm_head.bias".to_string(), b));
        }
        params
    }

    pub fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![("tok_emb.weight".to_string(), &mut self.tok_emb)];
        for (i, layer) in self.layers.iter_mut().enumerate() {
            params.extend(prefixed_mut(&format!("layers.{i}"), layer.named_parameters_mut()));
        }
        params.extend(prefixed_mut("norm", self.norm.named_parameters_mut()));
        if let Some(b) = &mut self.lm_head_bias {
            params.push(("lm_head.bias".to_string(), b));
        }
        params
    }

    pub fn num_params(&self) -> usize {
        self.named_parameters().iter().map(|(_, t)| t.numel()).sum()
    }

    /// Look up embeddings: (batch, seq_len, n_embd).
    fn embed(&self, token_ids: &[usize], batch: usize, seq_len: usize) -> Result<Tensor> {
        let d = self.config.n_embd;
        let vocab_size = self.config.vocab_size;
        let table = self.tok_emb.to_f32_vec();
        let mut out = vec![0.0f32; batch * seq_len * d];
        for (&token, dst) in token_ids.iter().zip(out.chunks_exact_mut(d)) {
            if token >= vocab_size {
                return Err(StuError::InvalidToken { token, vocab_size });
            }
            dst.copy_from_slice(&table[token * d..(token + 1) * d]);
        }
        Ok(Tensor::from_vec(out, &[batch, seq_len, d])?)
    }

    /// Inverted dropout; identity outside training mode.
    fn dropout(&self, x: Tensor) -> Result<Tensor> {
        let p = self.config.dropout;
        if !self.training || p == 0.0 {
            return Ok(x);
        }
        let keep = 1.0 / (1.0 - p);
        let mut rng = rand::thread_rng();
        let out: Vec<f32> = x
            .to_f32_vec()
            .into_iter()
            .map(|v| if rng.gen::<f32>() < p { 0.0 } else { v * keep })
            .collect();
        Ok(Tensor::from_vec(out, x.dims())?)
    }

    /// Forward pass: token ids → logits.
    ///
    /// `token_ids`: shape (batch * seq_len,) flattened
    /// Returns: logits, shape (batch, seq_len, vocab_size)
    pub fn forward(&self, token_ids: &[usize], batch: usize, seq_len: usize) -> Result<Tensor> {
        if token_ids.len() != batch * seq_len || seq_len > self.config.seq_len {
            return Err(CoreError::ShapeMismatch {
                expected: vec![batch, seq_len.min(self.config.seq_len)],
                got: vec![token_ids.len()],
            }
            .into());
        }

        let mut h = self.dropout(self.embed(token_ids, batch, seq_len)?)?;
        for layer in &self.layers {
            h = layer.forward(&h)?;
        }
        let h = self.norm.forward(&h)?;

        let logits = h.matmul(&self.tok_emb.transpose()?)?;
        match &self.lm_head_bias {
            None => Ok(logits),
            Some(bias) => {
                let b = bias.to_f32_vec();
                let mut out = logits.to_f32_vec();
                for row in out.chunks_exact_mut(b.len()) {
                    for (o, v) in row.iter_mut().zip(&b) {
                        *o += v;
                    }
                }
                Ok(Tensor::from_vec(out, logits.dims())?)
            }
        }
    }
}
