//! Pre-norm residual blocks: Norm -> mixer -> residual, Norm -> MLP -> residual.

use std::sync::Arc;

use tfilters_core::{prefixed, prefixed_mut, Module, Result, Tensor};

use crate::attention::Attention;
use crate::config::ModelConfig;
use crate::mlp::Mlp;
use crate::norm::{NormKernel, RmsNorm};
use crate::stu::Stu;

/// `x + f(norm(x))`
fn residual(x: &Tensor, norm: &RmsNorm, f: &dyn Module) -> Result<Tensor> {
    x.add(&f.forward(&norm.forward(x)?)?)
}

fn block_norm(config: &ModelConfig, kernel: NormKernel) -> RmsNorm {
    RmsNorm::new(config.n_embd, config.norm_eps, kernel).with_dtype(config.torch_dtype)
}

pub struct StuLayer {
    pub stu_norm: RmsNorm,
    pub stu: Stu,
    pub mlp_norm: RmsNorm,
    pub mlp: Mlp,
}

impl StuLayer {
    pub fn new(config: &ModelConfig, phi: Arc<Tensor>, n: usize, kernel: NormKernel) -> crate::Result<Self> {
        Ok(Self {
            stu_norm: block_norm(config, kernel),
            stu: Stu::new(config, phi, n)?,
            mlp_norm: block_norm(config, kernel),
            mlp: Mlp::new(config),
        })
    }
}

impl Module for StuLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = residual(x, &self.stu_norm, &self.stu)?;
        residual(&x, &self.mlp_norm, &self.mlp)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("stu_norm", self.stu_norm.named_parameters());
        params.extend(prefixed("stu", self.stu.named_parameters()));
        params.extend(prefixed("mlp_norm", self.mlp_norm.named_parameters()));
        params.extend(prefixed("mlp", self.mlp.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("stu_norm", self.stu_norm.named_parameters_mut());
        params.extend(prefixed_mut("stu", self.stu.named_parameters_mut()));
        params.extend(prefixed_mut("mlp_norm", self.mlp_norm.named_parameters_mut()));
        params.extend(prefixed_mut("mlp", self.mlp.named_parameters_mut()));
        params
    }
}

pub struct AttentionLayer {
    pub attn_norm: RmsNorm,
    pub attn: Attention,
    pub mlp_norm: RmsNorm,
    pub mlp: Mlp,
}

impl AttentionLayer {
    pub fn new(config: &ModelConfig, kernel: NormKernel) -> Self {
        Self {
            attn_norm: block_norm(config, kernel),
            attn: Attention::new(config),
            mlp_norm: block_norm(config, kernel),
            mlp: Mlp::new(config),
        }
    }
}

impl Module for AttentionLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = residual(x, &self.attn_norm, &self.attn)?;
        residual(&x, &self.mlp_norm, &self.mlp)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("attn_norm", self.attn_norm.named_parameters());
        params.extend(prefixed("attn", self.attn.named_parameters()));
        params.extend(prefixed("mlp_norm", self.mlp_norm.named_parameters()));
        params.extend(prefixed("mlp", self.mlp.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("attn_norm", self.attn_norm.named_parameters_mut());
        params.extend(prefixed_mut("attn", self.attn.named_parameters_mut()));
        params.extend(prefixed_mut("mlp_norm", self.mlp_norm.named_parameters_mut()));
        params.extend(prefixed_mut("mlp", self.mlp.named_parameters_mut()));
        params
    }
}

/// Which block a depth of the backbone holds.
pub enum Layer {
    Stu(StuLayer),
    Attention(AttentionLayer),
}

impl Layer {
    pub fn mlp_mut(&mut self) -> &mut Mlp {
        match self {
            Layer::Stu(l) => &mut l.mlp,
            Layer::Attention(l) => &mut l.mlp,
        }
    }

    pub fn is_stu(&self) -> bool {
        matches!(self, Layer::Stu(_))
    }
}

impl Module for Layer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Layer::Stu(l) => l.forward(x),
            Layer::Attention(l) => l.forward(x),
        }
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        match self {
            Layer::Stu(l) => l.named_parameters(),
            Layer::Attention(l) => l.named_parameters(),
        }
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        match self {
            Layer::Stu(l) => l.named_parameters_mut(),
            Layer::Attention(l) => l.named_parameters_mut(),
        }
    }
}
