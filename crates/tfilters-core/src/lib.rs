//! # tfilters-core
//!
//! Minimal tensor engine and module trait for the spectral filter layers.
//! CPU-only, no autograd: shapes, shared storage, reduced-precision
//! rounding, and the handful of ops the STU contractions need.

pub mod dtype;
pub mod storage;
pub mod shape;
pub mod tensor;
pub mod ops;
pub mod error;
pub mod module;

pub use dtype::DType;
pub use storage::Storage;
pub use shape::Shape;
pub use tensor::Tensor;
pub use error::CoreError;
pub use module::{prefixed, prefixed_mut, Module};

pub type Result<T> = std::result::Result<T, CoreError>;
