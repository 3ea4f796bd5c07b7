//! Accelerated convolution engine.
//!
//! Plans both FFTs once for a fixed power-of-two length and runs the
//! signal path in bf16, matching the reduced-precision kernels this engine
//! stands in for. Filters stay in f32. Results agree with [`ReferenceConv`]
//! within bf16 rounding error.
//!
//! [`ReferenceConv`]: crate::conv::ReferenceConv

use tfilters_core::{DType, Result, Tensor};

use crate::conv::{spectral_convolve, FftPlan, SpectralConv};

pub struct FlashFftConv {
    plan: FftPlan,
    precision: DType,
}

impl FlashFftConv {
    /// Whether the accelerated backend was compiled in.
    pub fn is_available() -> bool {
        cfg!(feature = "flash-fft")
    }

    /// Build an engine for length `n`, or `None` if the backend is missing
    /// or `n` is not a power of two of at least 2.
    pub fn probe(n: usize) -> Option<Self> {
        if !Self::is_available() || n < 2 || !n.is_power_of_two() {
            return None;
        }
        Some(Self {
            plan: FftPlan::new(n),
            precision: DType::BF16,
        })
    }

    pub fn precision(&self) -> DType {
        self.precision
    }
}

impl std::fmt::Debug for FlashFftConv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashFftConv")
            .field("n", &self.plan.len())
            .field("precision", &self.precision)
            .finish()
    }
}

impl SpectralConv for FlashFftConv {
    fn convolve(&self, signal: &Tensor, filters: &Tensor, approx: bool) -> Result<(Tensor, Tensor)> {
        spectral_convolve(&self.plan, signal, filters, approx, self.precision)
    }

    fn padded_len(&self) -> usize {
        self.plan.len()
    }

    fn name(&self) -> &'static str {
        "flash-fft"
    }
}

/// Convolve with an already-probed accelerated engine.
pub fn flash_convolve(
    signal: &Tensor,
    filters: &Tensor,
    engine: &FlashFftConv,
    approx: bool,
) -> Result<(Tensor, Tensor)> {
    engine.convolve(signal, filters, approx)
}
