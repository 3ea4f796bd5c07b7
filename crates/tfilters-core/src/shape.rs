use smallvec::SmallVec;
use std::fmt;

use crate::error::CoreError;
use crate::Result;

/// Tensor dimensions. The STU pipeline never goes above rank 4
/// (batch, seq, filter, channel), so four dims live inline.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Size of the innermost axis, 1 for scalars.
    pub fn last_dim(&self) -> usize {
        self.dims.last().copied().unwrap_or(1)
    }

    /// Fail unless the shape has exactly `rank` axes.
    pub fn expect_rank(&self, rank: usize) -> Result<()> {
        if self.ndim() != rank {
            return Err(CoreError::RankMismatch {
                expected: rank,
                got: self.dims.to_vec(),
            });
        }
        Ok(())
    }

    /// Fail unless the shape equals `expected` exactly.
    pub fn expect_dims(&self, expected: &[usize]) -> Result<()> {
        if self.dims.as_slice() != expected {
            return Err(CoreError::ShapeMismatch {
                expected: expected.to_vec(),
                got: self.dims.to_vec(),
            });
        }
        Ok(())
    }

    pub fn contiguous_strides(&self) -> SmallVec<[usize; 4]> {
        let mut strides: SmallVec<[usize; 4]> = SmallVec::from_elem(1usize, self.ndim());
        for i in (0..self.ndim().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Reorder axes; `perm` must be a permutation of `0..ndim`.
    pub fn permute(&self, perm: &[usize]) -> Result<Shape> {
        let ndim = self.ndim();
        let mut seen = [false; 8];
        let valid = perm.len() == ndim
            && ndim <= seen.len()
            && perm.iter().all(|&p| p < ndim && !std::mem::replace(&mut seen[p], true));
        if !valid {
            return Err(CoreError::InvalidPermutation {
                perm: perm.to_vec(),
                ndim,
            });
        }
        Ok(Shape {
            dims: perm.iter().map(|&p| self.dims[p]).collect(),
        })
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shape").field(&self.dims.as_slice()).finish()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dims.iter().map(usize::to_string).collect();
        write!(f, "({})", parts.join(", "))
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(&dims)
    }
}
