//! Spectral Transform Unit.
//!
//! An STU layer convolves its input with a fixed spectral basis `phi` and
//! mixes the responses with learned tensors. Four parameterisations exist,
//! picked once from `(use_approx, factorize)`:
//!
//! | use_approx | factorize | tensors                                        |
//! |------------|-----------|------------------------------------------------|
//! | true       | true      | `M_inputs`, `M_i (K, r)`, `M_j (r, d_in)`       |
//! | true       | false     | `M_inputs`, `M_filters (K, d_in)`               |
//! | false      | true      | `M_i_plus`, `M_j_plus` (+ `_minus` pair)        |
//! | false      | false     | `M_phi_plus` (+ `M_phi_minus`)                  |
//!
//! The minus-sign tensors exist only when the layer is not in Hankel-L mode.
//! The approximate path projects input and filters down before the
//! convolution; the exact path convolves the raw input against every
//! filter and contracts afterwards.

use std::sync::Arc;

use rand::Rng;
use tfilters_core::{CoreError, DType, Module, Tensor};
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::contract::{dense_filter_contraction, factorized_filter_contraction};
use crate::conv::{ReferenceConv, SpectralConv};
use crate::error::{Result, StuError};
use crate::flash::FlashFftConv;

/// A per-filter low-rank pair: `M_i (K, d_out, r)`, `M_j (K, r, d_in)`.
#[derive(Clone, Debug)]
pub struct FactorPair {
    pub m_i: Tensor,
    pub m_j: Tensor,
}

impl FactorPair {
    fn empty(k: usize, d_in: usize, d_out: usize, r: usize, dtype: DType) -> Self {
        Self {
            m_i: Tensor::empty(&[k, d_out, r], dtype),
            m_j: Tensor::empty(&[k, r, d_in], dtype),
        }
    }
}

/// The learned tensors of one STU layer. Exactly one variant is allocated.
#[derive(Clone, Debug)]
pub enum StuParams {
    ApproxFactorized {
        m_inputs: Tensor,
        m_i: Tensor,
        m_j: Tensor,
    },
    ApproxDense {
        m_inputs: Tensor,
        m_filters: Tensor,
    },
    ExactFactorized {
        plus: FactorPair,
        minus: Option<FactorPair>,
    },
    ExactDense {
        m_phi_plus: Tensor,
        m_phi_minus: Option<Tensor>,
    },
}

impl StuParams {
    /// Allocate the parameter set a configuration calls for.
    fn allocate(config: &ModelConfig, k: usize) -> Result<Self> {
        let d = config.n_embd;
        let dtype = config.torch_dtype;
        let with_minus = !config.use_hankel_l;

        let params = match (config.use_approx, config.rank()?) {
            (true, Some(r)) => StuParams::ApproxFactorized {
                m_inputs: Tensor::empty(&[d, d], dtype),
                m_i: Tensor::empty(&[k, r], dtype),
                m_j: Tensor::empty(&[r, d], dtype),
            },
            (true, None) => StuParams::ApproxDense {
                m_inputs: Tensor::empty(&[d, d], dtype),
                m_filters: Tensor::empty(&[k, d], dtype),
            },
            (false, Some(r)) => StuParams::ExactFactorized {
                plus: FactorPair::empty(k, d, d, r, dtype),
                minus: with_minus.then(|| FactorPair::empty(k, d, d, r, dtype)),
            },
            (false, None) => StuParams::ExactDense {
                m_phi_plus: Tensor::empty(&[k, d, d], dtype),
                m_phi_minus: with_minus.then(|| Tensor::empty(&[k, d, d], dtype)),
            },
        };
        Ok(params)
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            StuParams::ApproxFactorized { .. } => "approx-factorized",
            StuParams::ApproxDense { .. } => "approx-dense",
            StuParams::ExactFactorized { .. } => "exact-factorized",
            StuParams::ExactDense { .. } => "exact-dense",
        }
    }

    fn named(&self) -> Vec<(String, &Tensor)> {
        let mut out: Vec<(&str, &Tensor)> = Vec::new();
        match self {
            StuParams::ApproxFactorized { m_inputs, m_i, m_j } => {
                out.extend([("M_inputs", m_inputs), ("M_i", m_i), ("M_j", m_j)]);
            }
            StuParams::ApproxDense { m_inputs, m_filters } => {
                out.extend([("M_inputs", m_inputs), ("M_filters", m_filters)]);
            }
            StuParams::ExactFactorized { plus, minus } => {
                out.extend([("M_i_plus", &plus.m_i), ("M_j_plus", &plus.m_j)]);
                if let Some(minus) = minus {
                    out.extend([("M_i_minus", &minus.m_i), ("M_j_minus", &minus.m_j)]);
                }
            }
            StuParams::ExactDense { m_phi_plus, m_phi_minus } => {
                out.push(("M_phi_plus", m_phi_plus));
                if let Some(m) = m_phi_minus {
                    out.push(("M_phi_minus", m));
                }
            }
        }
        out.into_iter().map(|(n, t)| (n.to_string(), t)).collect()
    }

    fn named_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut out: Vec<(&str, &mut Tensor)> = Vec::new();
        match self {
            StuParams::ApproxFactorized { m_inputs, m_i, m_j } => {
                out.extend([("M_inputs", m_inputs), ("M_i", m_i), ("M_j", m_j)]);
            }
            StuParams::ApproxDense { m_inputs, m_filters } => {
                out.extend([("M_inputs", m_inputs), ("M_filters", m_filters)]);
            }
            StuParams::ExactFactorized { plus, minus } => {
                out.extend([("M_i_plus", &mut plus.m_i), ("M_j_plus", &mut plus.m_j)]);
                if let Some(minus) = minus {
                    out.extend([("M_i_minus", &mut minus.m_i), ("M_j_minus", &mut minus.m_j)]);
                }
            }
            StuParams::ExactDense { m_phi_plus, m_phi_minus } => {
                out.push(("M_phi_plus", m_phi_plus));
                if let Some(m) = m_phi_minus {
                    out.push(("M_phi_minus", m));
                }
            }
        }
        out.into_iter().map(|(n, t)| (n.to_string(), t)).collect()
    }
}

/// One STU layer with `d_in = d_out = n_embd`.
pub struct Stu {
    params: StuParams,
    phi: Arc<Tensor>,
    engine: Box<dyn SpectralConv>,
    d_in: usize,
    d_out: usize,
    k: usize,
    use_hankel_l: bool,
}

impl std::fmt::Debug for Stu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stu")
            .field("variant", &self.params.variant_name())
            .field("engine", &self.engine.name())
            .field("k", &self.k)
            .field("d_in", &self.d_in)
            .field("d_out", &self.d_out)
            .field("use_hankel_l", &self.use_hankel_l)
            .finish()
    }
}

impl Stu {
    /// Build a layer over the shared basis `phi` (`(seq_len, K)`) that
    /// convolves at length `n`.
    pub fn new(config: &ModelConfig, phi: Arc<Tensor>, n: usize) -> Result<Self> {
        let k = config.num_filters();
        phi.shape().expect_rank(2)?;
        if phi.dims()[1] != k {
            return Err(StuError::FilterWidthMismatch {
                expected: k,
                got: phi.dims()[1],
            });
        }

        let params = StuParams::allocate(config, k)?;
        let engine = select_engine(config.use_flash_fft, n);
        debug!(
            variant = params.variant_name(),
            engine = engine.name(),
            k,
            n,
            "built STU layer"
        );

        Ok(Self {
            params,
            phi,
            engine,
            d_in: config.n_embd,
            d_out: config.n_embd,
            k,
            use_hankel_l: config.use_hankel_l,
        })
    }

    pub fn params(&self) -> &StuParams {
        &self.params
    }

    pub fn phi(&self) -> &Arc<Tensor> {
        &self.phi
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn num_filters(&self) -> usize {
        self.k
    }

    /// Redraw every tensor from `N(0, std^2)`, keeping its dtype.
    pub fn init_weights<R: Rng>(&mut self, std: f32, rng: &mut R) {
        for (_, t) in self.params.named_mut() {
            *t = Tensor::randn_with(t.dims(), std, rng).to_dtype(t.dtype());
        }
    }

    /// Overwrite one tensor by name. The replacement is cast to the
    /// tensor's dtype and must match its shape.
    pub fn load_parameter(&mut self, name: &str, value: Tensor) -> Result<()> {
        let slot = self
            .params
            .named_mut()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
            .ok_or_else(|| StuError::UnknownParameter(name.to_string()))?;
        if slot.dims() != value.dims() {
            return Err(CoreError::ShapeMismatch {
                expected: slot.dims().to_vec(),
                got: value.dims().to_vec(),
            }
            .into());
        }
        *slot = value.to_dtype(slot.dtype());
        Ok(())
    }

    fn check_input(&self, x: &Tensor) -> tfilters_core::Result<()> {
        x.shape().expect_rank(3)?;
        let (l, d) = (x.dims()[1], x.dims()[2]);
        if d != self.d_in || l > self.phi.dims()[0] {
            return Err(CoreError::ShapeMismatch {
                expected: vec![x.dims()[0], l.min(self.phi.dims()[0]), self.d_in],
                got: x.dims().to_vec(),
            });
        }
        Ok(())
    }

    fn combine(&self, plus: Tensor, minus: Option<Tensor>) -> tfilters_core::Result<Tensor> {
        match minus {
            Some(minus) if !self.use_hankel_l => plus.add(&minus),
            _ => Ok(plus),
        }
    }

    fn forward_approx(
        &self,
        x: &Tensor,
        m_inputs: &Tensor,
        filters: tfilters_core::Result<Tensor>,
    ) -> tfilters_core::Result<Tensor> {
        let x_proj = x.matmul(m_inputs)?;
        let phi_proj = filters?;
        let (plus, minus) = self.engine.convolve(&x_proj, &phi_proj, true)?;
        self.combine(plus, Some(minus))
    }
}

/// Resolve the convolution engine once. A missing accelerated backend
/// degrades to the reference engine.
fn select_engine(use_flash_fft: bool, n: usize) -> Box<dyn SpectralConv> {
    if use_flash_fft {
        match FlashFftConv::probe(n) {
            Some(engine) => return Box::new(engine),
            None => warn!(n, "accelerated FFT convolution unavailable, using reference engine"),
        }
    }
    Box::new(ReferenceConv::new(n))
}

impl Module for Stu {
    fn forward(&self, x: &Tensor) -> tfilters_core::Result<Tensor> {
        self.check_input(x)?;
        match &self.params {
            StuParams::ApproxDense { m_inputs, m_filters } => {
                self.forward_approx(x, m_inputs, self.phi.matmul(m_filters))
            }
            StuParams::ApproxFactorized { m_inputs, m_i, m_j } => {
                let filters = self.phi.matmul(m_i).and_then(|p| p.matmul(m_j));
                self.forward_approx(x, m_inputs, filters)
            }
            StuParams::ExactDense { m_phi_plus, m_phi_minus } => {
                let (u_plus, u_minus) = self.engine.convolve(x, &self.phi, false)?;
                let plus = dense_filter_contraction(&u_plus, m_phi_plus)?;
                let minus = match m_phi_minus {
                    Some(m) if !self.use_hankel_l => Some(dense_filter_contraction(&u_minus, m)?),
                    _ => None,
                };
                self.combine(plus, minus)
            }
            StuParams::ExactFactorized { plus, minus } => {
                let (u_plus, u_minus) = self.engine.convolve(x, &self.phi, false)?;
                let out_plus = factorized_filter_contraction(&u_plus, &plus.m_i, &plus.m_j)?;
                let out_minus = match minus {
                    Some(pair) if !self.use_hankel_l => {
                        Some(factorized_filter_contraction(&u_minus, &pair.m_i, &pair.m_j)?)
                    }
                    _ => None,
                };
                self.combine(out_plus, out_minus)
            }
        }
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        self.params.named()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        self.params.named_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectral::get_spectral_filters;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn build(use_approx: bool, factorize: bool, hankel: bool) -> Stu {
        let mut cfg = ModelConfig::tiny();
        cfg.use_approx = use_approx;
        cfg.factorize = factorize;
        cfg.r = factorize.then_some(3);
        cfg.use_hankel_l = hankel;
        let phi = get_spectral_filters(cfg.seq_len, cfg.num_filters(), hankel, DType::F32).unwrap();
        let mut stu = Stu::new(&cfg, Arc::new(phi), cfg.padded_len()).unwrap();
        stu.init_weights(0.25, &mut StdRng::seed_from_u64(1));
        stu
    }

    fn names(stu: &Stu) -> Vec<String> {
        stu.named_parameters().into_iter().map(|(n, _)| n).collect()
    }

    #[test]
    fn test_variant_selection() {
        assert_eq!(build(true, true, false).params().variant_name(), "approx-factorized");
        assert_eq!(build(true, false, false).params().variant_name(), "approx-dense");
        assert_eq!(build(false, true, false).params().variant_name(), "exact-factorized");
        assert_eq!(build(false, false, false).params().variant_name(), "exact-dense");
    }

    #[test]
    fn test_parameter_names_and_shapes() {
        let stu = build(false, false, false);
        assert_eq!(names(&stu), ["M_phi_plus", "M_phi_minus"]);
        assert_eq!(stu.named_parameters()[0].1.dims(), &[4, 16, 16]);

        let stu = build(false, true, true);
        assert_eq!(names(&stu), ["M_i_plus", "M_j_plus"]);
        let params = stu.named_parameters();
        assert_eq!(params[0].1.dims(), &[4, 16, 3]);
        assert_eq!(params[1].1.dims(), &[4, 3, 16]);

        let stu = build(true, true, false);
        assert_eq!(names(&stu), ["M_inputs", "M_i", "M_j"]);
        assert_eq!(stu.named_parameters()[1].1.dims(), &[4, 3]);
    }

    #[test]
    fn test_hankel_mode_drops_minus() {
        assert_eq!(names(&build(false, false, true)), ["M_phi_plus"]);
        // The approximate path has no sign-specific tensors.
        assert_eq!(names(&build(true, false, true)), ["M_inputs", "M_filters"]);
    }

    #[test]
    fn test_forward_shapes() {
        let mut rng = StdRng::seed_from_u64(2);
        let x = Tensor::randn_with(&[2, 8, 16], 1.0, &mut rng);
        for (approx, factorize, hankel) in [
            (true, true, false),
            (true, false, true),
            (false, true, false),
            (false, false, true),
        ] {
            let stu = build(approx, factorize, hankel);
            let y = stu.forward(&x).unwrap();
            assert_eq!(y.dims(), &[2, 8, 16]);
            assert!(y.to_f32_vec().iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_shorter_input_accepted() {
        let stu = build(false, false, false);
        let y = stu.forward(&Tensor::ones(&[1, 5, 16])).unwrap();
        assert_eq!(y.dims(), &[1, 5, 16]);
    }

    #[test]
    fn test_rejects_bad_input() {
        let stu = build(false, false, false);
        assert!(matches!(
            stu.forward(&Tensor::ones(&[1, 8, 15])),
            Err(CoreError::ShapeMismatch { .. })
        ));
        assert!(stu.forward(&Tensor::ones(&[1, 9, 16])).is_err());
        assert!(stu.forward(&Tensor::ones(&[8, 16])).is_err());
    }

    #[test]
    fn test_phi_width_checked() {
        let cfg = ModelConfig::tiny();
        let phi = Arc::new(Tensor::zeros(&[8, 3], DType::F32));
        assert!(matches!(
            Stu::new(&cfg, phi, 16),
            Err(StuError::FilterWidthMismatch { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn test_factorize_requires_rank() {
        let mut cfg = ModelConfig::tiny();
        cfg.factorize = true;
        let phi = Arc::new(Tensor::zeros(&[8, 4], DType::F32));
        assert!(matches!(Stu::new(&cfg, phi, 16), Err(StuError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_parameter() {
        let mut stu = build(false, false, true);
        stu.load_parameter("M_phi_plus", Tensor::ones(&[4, 16, 16])).unwrap();
        assert_eq!(stu.named_parameters()[0].1.sum_all(), (4 * 16 * 16) as f32);
        assert!(matches!(
            stu.load_parameter("M_phi_minus", Tensor::ones(&[4, 16, 16])),
            Err(StuError::UnknownParameter(_))
        ));
        assert!(stu.load_parameter("M_phi_plus", Tensor::ones(&[4, 16, 8])).is_err());
    }

    #[test]
    fn test_phi_is_shared_not_copied() {
        let cfg = ModelConfig::tiny();
        let phi = Arc::new(get_spectral_filters(8, 4, false, DType::F32).unwrap());
        let a = Stu::new(&cfg, Arc::clone(&phi), 16).unwrap();
        let b = Stu::new(&cfg, Arc::clone(&phi), 16).unwrap();
        assert!(Arc::ptr_eq(a.phi(), b.phi()));
        assert_eq!(a.engine_name(), "reference");
    }

    #[test]
    fn test_bf16_parameters() {
        let mut cfg = ModelConfig::tiny();
        cfg.torch_dtype = DType::BF16;
        let phi = Arc::new(get_spectral_filters(8, 4, false, DType::BF16).unwrap());
        let mut stu = Stu::new(&cfg, phi, 16).unwrap();
        stu.init_weights(0.1, &mut StdRng::seed_from_u64(9));
        assert!(stu.parameters().iter().all(|t| t.dtype() == DType::BF16));
        let y = stu.forward(&Tensor::ones(&[1, 8, 16])).unwrap();
        assert_eq!(y.dims(), &[1, 8, 16]);
    }
}
