//! # tfilters-stu
//!
//! Spectral Transform Unit (STU) layers and a transformer backbone that
//! interleaves them with causal attention.
//!
//! An STU layer convolves its input with a fixed basis of Hankel
//! eigenfilters and mixes the responses with learned tensors, either
//! dense or low-rank, either before the convolution (approximate path) or
//! after it (exact path).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tfilters_stu::{ModelConfig, Transformer};
//!
//! let config = ModelConfig::tiny();
//! let model = Transformer::new(config).unwrap();
//! let tokens: Vec<usize> = (0..16).collect();
//! let logits = model.forward(&tokens, 2, 8).unwrap(); // (2, 8, vocab)
//! ```

pub mod error;
pub mod config;
pub mod numerics;
pub mod spectral;
pub mod conv;
pub mod flash;
pub mod contract;
pub mod stu;
pub mod norm;
pub mod linear;
pub mod mlp;
pub mod attention;
pub mod layers;
pub mod model;
pub mod telemetry;

pub use error::{Result, StuError};
pub use config::{LayerKind, LayerPattern, ModelConfig};
pub use numerics::{nearest_power_of_two, padded_conv_len};
pub use spectral::{get_hankel, get_spectral_filters, SpectralBasis};
pub use conv::{convolve, ReferenceConv, SpectralConv};
pub use flash::{flash_convolve, FlashFftConv};
pub use contract::{dense_filter_contraction, densify, factorized_filter_contraction};
pub use stu::{FactorPair, Stu, StuParams};
pub use norm::{NormKernel, RmsNorm};
pub use linear::Linear;
pub use mlp::Mlp;
pub use attention::Attention;
pub use layers::{AttentionLayer, Layer, StuLayer};
pub use model::Transformer;
pub use telemetry::{init_tracing, InitError};
