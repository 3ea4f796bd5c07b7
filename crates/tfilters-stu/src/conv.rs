//! Causal spectral convolution and the reference engine.
//!
//! Every engine returns a pair of responses keyed by filter sign:
//!
//! - plus:  `y[t] = sum_{s<=t} f[t-s] * u[s]`
//! - minus: `y[t] = sum_{s<=t} (-1)^(t-s) * f[t-s] * u[s]`
//!
//! The minus term is computed as `sgn[t] * conv(u * sgn, f)[t]` with
//! `sgn[t] = (-1)^t`, so both terms share one set of filter spectra.
//!
//! Shapes:
//! - approx: signal `(B, L, D)`, filters `(L_f, D)` -> `(B, L, D)` each,
//!   channel `d` filtered by column `d`.
//! - exact:  signal `(B, L, D)`, filters `(L_f, K)` -> `(B, L, K, D)` each,
//!   every channel filtered by every column.
//!
//! Only the first `L` filter taps reach the output, so `L_f >= L` is
//! required, and the FFT length `n` must hold `2L - 1` samples.

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use tfilters_core::{CoreError, DType, Result, Tensor};

/// A convolution backend. Selected once when a layer is built; the layer
/// never inspects which concrete engine it holds.
pub trait SpectralConv: Send + Sync {
    /// Plus/minus responses of `signal` against `filters`.
    fn convolve(&self, signal: &Tensor, filters: &Tensor, approx: bool) -> Result<(Tensor, Tensor)>;

    /// FFT length the engine convolves at.
    fn padded_len(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// Forward/inverse FFT plans of one length.
pub(crate) struct FftPlan {
    n: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl FftPlan {
    pub(crate) fn new(n: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            n,
            forward: planner.plan_fft_forward(n),
            inverse: planner.plan_fft_inverse(n),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.n
    }

    /// Zero-padded spectrum of a real sequence.
    fn spectrum(&self, values: impl Iterator<Item = f32>) -> Vec<Complex32> {
        let mut buf = vec![Complex32::new(0.0, 0.0); self.n];
        for (slot, v) in buf.iter_mut().zip(values) {
            slot.re = v;
        }
        self.forward.process(&mut buf);
        buf
    }

    /// First `len` samples of `ifft(a * b)`, normalised.
    fn causal_product(&self, a: &[Complex32], b: &[Complex32], len: usize, out: &mut [f32]) {
        let mut buf: Vec<Complex32> = a.iter().zip(b).map(|(x, y)| x * y).collect();
        self.inverse.process(&mut buf);
        let scale = 1.0 / self.n as f32;
        for (o, c) in out.iter_mut().zip(&buf[..len]) {
            *o = c.re * scale;
        }
    }
}

#[inline]
fn sgn(t: usize) -> f32 {
    if t % 2 == 0 {
        1.0
    } else {
        -1.0
    }
}

/// Shared kernel for both engines. `precision` is the format the signal
/// and the responses are rounded to.
pub(crate) fn spectral_convolve(
    plan: &FftPlan,
    signal: &Tensor,
    filters: &Tensor,
    approx: bool,
    precision: DType,
) -> Result<(Tensor, Tensor)> {
    signal.shape().expect_rank(3)?;
    filters.shape().expect_rank(2)?;
    let (b, l, d) = (signal.dims()[0], signal.dims()[1], signal.dims()[2]);
    let (lf, c) = (filters.dims()[0], filters.dims()[1]);

    if lf < l {
        return Err(CoreError::ShapeMismatch {
            expected: vec![l, c],
            got: filters.dims().to_vec(),
        });
    }
    if approx && c != d {
        return Err(CoreError::ShapeMismatch {
            expected: vec![lf, d],
            got: filters.dims().to_vec(),
        });
    }
    if l > 0 && 2 * l - 1 > plan.len() {
        return Err(CoreError::PaddedLengthTooShort {
            seq_len: l,
            padded: plan.len(),
        });
    }

    let u: Vec<f32> = signal.to_f32_vec().into_iter().map(|v| precision.round(v)).collect();
    let f = filters.to_f32_vec();

    // One spectrum per filter column, truncated to the first L taps.
    let filter_spectra: Vec<Vec<Complex32>> = (0..c)
        .map(|col| plan.spectrum((0..l).map(|t| f[t * c + col])))
        .collect();

    let k = if approx { 1 } else { c };
    let mut plus = vec![0.0f32; b * l * k * d];
    let mut minus = vec![0.0f32; b * l * k * d];
    let mut y_plus = vec![0.0f32; l];
    let mut y_minus = vec![0.0f32; l];

    for bi in 0..b {
        for di in 0..d {
            let at = |t: usize| u[(bi * l + t) * d + di];
            let u_plus = plan.spectrum((0..l).map(at));
            let u_minus = plan.spectrum((0..l).map(|t| at(t) * sgn(t)));

            let columns = if approx { di..di + 1 } else { 0..c };
            for (ki, col) in columns.enumerate() {
                plan.causal_product(&filter_spectra[col], &u_plus, l, &mut y_plus);
                plan.causal_product(&filter_spectra[col], &u_minus, l, &mut y_minus);
                for t in 0..l {
                    let idx = ((bi * l + t) * k + ki) * d + di;
                    plus[idx] = precision.round(y_plus[t]);
                    minus[idx] = precision.round(y_minus[t] * sgn(t));
                }
            }
        }
    }

    let dims: Vec<usize> = if approx { vec![b, l, d] } else { vec![b, l, c, d] };
    Ok((Tensor::from_vec(plus, &dims)?, Tensor::from_vec(minus, &dims)?))
}

/// Reference causal convolution at FFT length `n`, full f32 precision.
///
/// `n` should be at least `2 * L - 1`; callers normally pass
/// [`crate::numerics::padded_conv_len`].
pub fn convolve(signal: &Tensor, filters: &Tensor, n: usize, approx: bool) -> Result<(Tensor, Tensor)> {
    let plan = FftPlan::new(n);
    spectral_convolve(&plan, signal, filters, approx, DType::F32)
}

/// Reference engine: plans its FFTs on every call.
#[derive(Clone, Debug)]
pub struct ReferenceConv {
    n: usize,
}

impl ReferenceConv {
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl SpectralConv for ReferenceConv {
    fn convolve(&self, signal: &Tensor, filters: &Tensor, approx: bool) -> Result<(Tensor, Tensor)> {
        convolve(signal, filters, self.n, approx)
    }

    fn padded_len(&self) -> usize {
        self.n
    }

    fn name(&self) -> &'static str {
        "reference"
    }
}
