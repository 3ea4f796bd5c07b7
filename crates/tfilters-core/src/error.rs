use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("expected shape {expected:?}, found {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Expected a rank-{expected} tensor, got shape {got:?}")]
    RankMismatch { expected: usize, got: Vec<usize> },

    #[error("axis {axis} does not exist on a rank-{ndim} tensor")]
    InvalidAxis { axis: usize, ndim: usize },

    #[error("Invalid permutation {perm:?} for tensor with {ndim} dimensions")]
    InvalidPermutation { perm: Vec<usize>, ndim: usize },

    #[error("Index {index:?} out of bounds for shape {shape:?}")]
    IndexOutOfBounds { index: Vec<usize>, shape: Vec<usize> },

    #[error("cannot multiply ({m}, {k1}) by ({k2}, {n})")]
    MatmulDimMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    #[error("Padded length {padded} is too short for a causal convolution of length {seq_len}")]
    PaddedLengthTooShort { seq_len: usize, padded: usize },

    #[error("Unknown dtype name: {0}")]
    UnknownDType(String),

    #[error("storage: {0}")]
    StorageError(String),
}
