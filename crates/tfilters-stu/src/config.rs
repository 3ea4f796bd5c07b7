//! Model configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tfilters_core::DType;

use crate::error::{Result, StuError};
use crate::numerics::padded_conv_len;

/// Which sublayer sits at each depth of the backbone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LayerPattern {
    /// Attention everywhere.
    Attention,
    /// STU everywhere.
    Stu,
    /// STU at even depths, attention at odd depths.
    #[default]
    Alternating,
}

/// Which sublayer kind a given depth uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Stu,
    Attention,
}

impl LayerPattern {
    pub fn kind_at(&self, layer_idx: usize) -> LayerKind {
        match self {
            LayerPattern::Attention => LayerKind::Attention,
            LayerPattern::Stu => LayerKind::Stu,
            LayerPattern::Alternating if layer_idx % 2 == 0 => LayerKind::Stu,
            LayerPattern::Alternating => LayerKind::Attention,
        }
    }
}

/// Configuration shared by the backbone and every STU layer in it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding width; STU layers use it for both `d_in` and `d_out`.
    pub n_embd: usize,
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    pub n_layers: usize,
    pub seq_len: usize,
    pub vocab_size: usize,
    /// Hidden width of the MLP blocks as a multiple of `n_embd`.
    #[serde(default = "default_mlp_scale")]
    pub mlp_scale: usize,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default)]
    pub bias: bool,
    #[serde(default)]
    pub torch_dtype: DType,
    /// Eigenfilters per sign; the filter count K is its square.
    pub num_eigh: usize,
    /// Factorisation rank, required when `factorize` is set.
    #[serde(default)]
    pub r: Option<usize>,
    #[serde(default)]
    pub factorize: bool,
    #[serde(rename = "use_hankel_L", default)]
    pub use_hankel_l: bool,
    #[serde(default)]
    pub use_approx: bool,
    #[serde(default = "default_true")]
    pub use_flash_fft: bool,
    #[serde(default = "default_true")]
    pub use_fused_norm: bool,
    #[serde(default)]
    pub layer_pattern: LayerPattern,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,
}

fn default_n_heads() -> usize { 1 }
fn default_mlp_scale() -> usize { 4 }
fn default_true() -> bool { true }
fn default_norm_eps() -> f32 { 1e-6 }

impl ModelConfig {
    /// Number of spectral filter channels K.
    pub fn num_filters(&self) -> usize {
        self.num_eigh * self.num_eigh
    }

    /// Convolution length `n` for this sequence length.
    pub fn padded_len(&self) -> usize {
        padded_conv_len(self.seq_len)
    }

    /// Rank for the factorised parameter sets, if factorisation is on.
    pub fn rank(&self) -> Result<Option<usize>> {
        if !self.factorize {
            return Ok(None);
        }
        match self.r {
            Some(0) => Err(StuError::InvalidConfig("rank r must be positive".into())),
            Some(r) => Ok(Some(r)),
            None => Err(StuError::InvalidConfig(
                "factorize is set but rank r is missing".into(),
            )),
        }
    }

    /// Reject internally inconsistent configurations. No defaults are
    /// inferred for missing fields.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("n_embd", self.n_embd),
            ("n_heads", self.n_heads),
            ("seq_len", self.seq_len),
            ("vocab_size", self.vocab_size),
            ("num_eigh", self.num_eigh),
            ("mlp_scale", self.mlp_scale),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(StuError::InvalidConfig(format!("{name} must be positive")));
        }
        if self.n_embd % self.n_heads != 0 {
            return Err(StuError::InvalidConfig(format!(
                "n_embd ({}) must be divisible by n_heads ({})",
                self.n_embd, self.n_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(StuError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        self.rank()?;
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ModelConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a `config.json`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// A tiny config for unit tests.
    pub fn tiny() -> Self {
        Self {
            n_embd: 16,
            n_heads: 2,
            n_layers: 2,
            seq_len: 8,
            vocab_size: 32,
            mlp_scale: 2,
            dropout: 0.0,
            bias: false,
            torch_dtype: DType::F32,
            num_eigh: 2,
            r: None,
            factorize: false,
            use_hankel_l: false,
            use_approx: false,
            use_flash_fft: false,
            use_fused_norm: true,
            layer_pattern: LayerPattern::Alternating,
            norm_eps: 1e-6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_filters_is_square() {
        let cfg = ModelConfig::tiny();
        assert_eq!(cfg.num_filters(), 4);
        assert_eq!(cfg.padded_len(), 16);
    }

    #[test]
    fn test_factorize_without_rank_rejected() {
        let mut cfg = ModelConfig::tiny();
        cfg.factorize = true;
        assert!(matches!(cfg.validate(), Err(StuError::InvalidConfig(_))));
        cfg.r = Some(0);
        assert!(cfg.validate().is_err());
        cfg.r = Some(2);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.rank().unwrap(), Some(2));
    }

    #[test]
    fn test_heads_must_divide_width() {
        let mut cfg = ModelConfig::tiny();
        cfg.n_heads = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_deserialize_config() {
        let json = r#"{
            "n_embd": 64,
            "n_layers": 4,
            "seq_len": 128,
            "vocab_size": 1000,
            "num_eigh": 4,
            "torch_dtype": "bfloat16",
            "use_hankel_L": true,
            "factorize": true,
            "r": 8,
            "layer_pattern": "stu"
        }"#;
        let cfg = ModelConfig::from_json_str(json).unwrap();
        assert_eq!(cfg.n_embd, 64);
        assert_eq!(cfg.torch_dtype, DType::BF16);
        assert!(cfg.use_hankel_l);
        assert!(cfg.use_flash_fft); // default
        assert_eq!(cfg.layer_pattern, LayerPattern::Stu);
        assert_eq!(cfg.num_filters(), 16);
        assert_eq!(cfg.padded_len(), 256);
    }

    #[test]
    fn test_deserialize_rejects_missing_rank() {
        let json = r#"{
            "n_embd": 8, "n_layers": 1, "seq_len": 4,
            "vocab_size": 10, "num_eigh": 1, "factorize": true
        }"#;
        assert!(ModelConfig::from_json_str(json).is_err());
    }

    #[test]
    fn test_alternating_pattern() {
        let p = LayerPattern::Alternating;
        assert_eq!(p.kind_at(0), LayerKind::Stu);
        assert_eq!(p.kind_at(1), LayerKind::Attention);
        assert_eq!(LayerPattern::Stu.kind_at(1), LayerKind::Stu);
    }
}
