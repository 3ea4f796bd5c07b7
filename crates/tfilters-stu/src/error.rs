use thiserror::Error;

use tfilters_core::CoreError;

#[derive(Error, Debug)]
pub enum StuError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Spectral basis has {got} filters, layer expects {expected}")]
    FilterWidthMismatch { expected: usize, got: usize },

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Token id {token} out of range for vocabulary of {vocab_size}")]
    InvalidToken { token: usize, vocab_size: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StuError>;
