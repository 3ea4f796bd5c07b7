//! End-to-end properties of the STU layer across all four parameterisations.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tfilters_core::{CoreError, DType, Module, Tensor};
use tfilters_stu::{
    convolve, densify, get_spectral_filters, FlashFftConv, ModelConfig, Stu, StuError,
};

fn config(use_approx: bool, factorize: bool, use_hankel_l: bool) -> ModelConfig {
    let mut cfg = ModelConfig::tiny();
    cfg.n_embd = 6;
    cfg.n_heads = 1;
    cfg.use_approx = use_approx;
    cfg.factorize = factorize;
    cfg.r = factorize.then_some(2);
    cfg.use_hankel_l = use_hankel_l;
    cfg
}

fn basis(cfg: &ModelConfig) -> Arc<Tensor> {
    Arc::new(
        get_spectral_filters(cfg.seq_len, cfg.num_filters(), cfg.use_hankel_l, DType::F32).unwrap(),
    )
}

fn layer(cfg: &ModelConfig, phi: &Arc<Tensor>) -> Stu {
    Stu::new(cfg, Arc::clone(phi), cfg.padded_len()).unwrap()
}

fn max_abs(t: &Tensor) -> f32 {
    t.to_f32_vec().iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

#[test]
fn test_exact_factorized_matches_dense() {
    let cfg = config(false, true, false);
    let phi = basis(&cfg);
    let mut rng = StdRng::seed_from_u64(10);
    let mut factorized = layer(&cfg, &phi);
    factorized.init_weights(0.4, &mut rng);

    let mut dense = layer(&config(false, false, false), &phi);
    let params: Vec<(String, Tensor)> = factorized
        .named_parameters()
        .into_iter()
        .map(|(n, t)| (n, t.clone()))
        .collect();
    let get = |name: &str| params.iter().find(|(n, _)| n == name).unwrap().1.clone();
    dense
        .load_parameter("M_phi_plus", densify(&get("M_i_plus"), &get("M_j_plus")).unwrap())
        .unwrap();
    dense
        .load_parameter("M_phi_minus", densify(&get("M_i_minus"), &get("M_j_minus")).unwrap())
        .unwrap();

    let x = Tensor::randn_with(&[2, 8, 6], 1.0, &mut rng);
    let a = factorized.forward(&x).unwrap();
    let b = dense.forward(&x).unwrap();
    assert!(a.max_abs_diff(&b).unwrap() <= 1e-4 * max_abs(&b).max(1.0));
}

#[test]
fn test_approx_factorized_matches_dense() {
    let cfg = config(true, true, false);
    let phi = basis(&cfg);
    let mut rng = StdRng::seed_from_u64(11);
    let mut factorized = layer(&cfg, &phi);
    factorized.init_weights(0.4, &mut rng);

    let named = factorized.named_parameters();
    let m_inputs = named[0].1.clone();
    let m_filters = named[1].1.matmul(named[2].1).unwrap();

    let mut dense = layer(&config(true, false, false), &phi);
    dense.load_parameter("M_inputs", m_inputs).unwrap();
    dense.load_parameter("M_filters", m_filters).unwrap();

    let x = Tensor::randn_with(&[3, 8, 6], 1.0, &mut rng);
    let a = factorized.forward(&x).unwrap();
    let b = dense.forward(&x).unwrap();
    assert!(a.max_abs_diff(&b).unwrap() <= 1e-4 * max_abs(&b).max(1.0));
}

#[test]
fn test_approx_path_matches_direct_convolution() {
    let mut rng = StdRng::seed_from_u64(17);
    let x = Tensor::randn_with(&[2, 8, 6], 1.0, &mut rng);
    for hankel in [false, true] {
        let cfg = config(true, false, hankel);
        let phi = basis(&cfg);
        let mut stu = layer(&cfg, &phi);
        stu.init_weights(0.4, &mut rng);
        let named = stu.named_parameters();
        let (m_inputs, m_filters) = (named[0].1.clone(), named[1].1.clone());

        let (plus, minus) = convolve(
            &x.matmul(&m_inputs).unwrap(),
            &phi.matmul(&m_filters).unwrap(),
            cfg.padded_len(),
            true,
        )
        .unwrap();
        let want = if hankel { plus } else { plus.add(&minus).unwrap() };

        let got = stu.forward(&x).unwrap();
        assert!(got.allclose(&want, 1e-5, 1e-6), "hankel={hankel}");
    }

    // `x @ M_inputs`, not its transpose: a non-symmetric projection must
    // change the result when transposed.
    let cfg = config(true, false, false);
    let phi = basis(&cfg);
    let mut stu = layer(&cfg, &phi);
    stu.init_weights(0.4, &mut rng);
    let m_inputs = stu.named_parameters()[0].1.clone();
    let m_filters = stu.named_parameters()[1].1.clone();
    let filters = phi.matmul(&m_filters).unwrap();
    let n = cfg.padded_len();
    let (p, m) = convolve(&x.matmul(&m_inputs).unwrap(), &filters, n, true).unwrap();
    let (pt, mt) = convolve(
        &x.matmul(&m_inputs.transpose().unwrap()).unwrap(),
        &filters,
        n,
        true,
    )
    .unwrap();
    let right = p.add(&m).unwrap();
    let wrong = pt.add(&mt).unwrap();
    let got = stu.forward(&x).unwrap();
    assert!(got.allclose(&right, 1e-5, 1e-6));
    assert!(!got.allclose(&wrong, 1e-3, 1e-3));
}

#[test]
fn test_accelerated_engine_matches_reference() {
    if !FlashFftConv::is_available() {
        return;
    }
    for (approx, factorize) in [(false, false), (false, true), (true, false), (true, true)] {
        let mut cfg = config(approx, factorize, false);
        let phi = basis(&cfg);
        let mut reference = layer(&cfg, &phi);
        reference.init_weights(0.3, &mut StdRng::seed_from_u64(12));
        assert_eq!(reference.engine_name(), "reference");

        cfg.use_flash_fft = true;
        let mut flash = layer(&cfg, &phi);
        flash.init_weights(0.3, &mut StdRng::seed_from_u64(12));
        assert_eq!(flash.engine_name(), "flash-fft");

        let x = Tensor::randn_with(&[2, 8, 6], 1.0, &mut StdRng::seed_from_u64(13));
        let want = reference.forward(&x).unwrap();
        let got = flash.forward(&x).unwrap();
        assert!(
            got.max_abs_diff(&want).unwrap() <= 1e-2 * max_abs(&want),
            "approx={approx} factorize={factorize}"
        );
    }
}

#[test]
fn test_missing_accelerator_falls_back() {
    // n = 12 is not a power of two, so the accelerated engine cannot bind.
    let mut cfg = config(false, false, true);
    cfg.use_flash_fft = true;
    cfg.seq_len = 6;
    cfg.num_eigh = 2;
    let phi = basis(&cfg);
    let stu = Stu::new(&cfg, phi, 12).unwrap();
    assert_eq!(stu.engine_name(), "reference");
    assert_eq!(stu.forward(&Tensor::ones(&[1, 6, 6])).unwrap().dims(), &[1, 6, 6]);
}

#[test]
fn test_zero_minus_reduces_to_hankel_mode() {
    let phi = basis(&config(false, false, false));
    let mut rng = StdRng::seed_from_u64(14);
    let x = Tensor::randn_with(&[2, 8, 6], 1.0, &mut rng);
    let m_plus = Tensor::randn_with(&[4, 6, 6], 0.5, &mut rng);

    let mut both = layer(&config(false, false, false), &phi);
    both.load_parameter("M_phi_plus", m_plus.clone()).unwrap();
    both.load_parameter("M_phi_minus", Tensor::zeros(&[4, 6, 6], DType::F32)).unwrap();

    let mut plus_only = layer(&config(false, false, true), &phi);
    plus_only.load_parameter("M_phi_plus", m_plus).unwrap();

    let a = both.forward(&x).unwrap();
    let b = plus_only.forward(&x).unwrap();
    assert!(a.allclose(&b, 1e-6, 1e-6));

    // Same reduction for the factorised exact path.
    let mut both = layer(&config(false, true, false), &phi);
    both.init_weights(0.5, &mut rng);
    let m_i = both.named_parameters()[0].1.clone();
    let m_j = both.named_parameters()[1].1.clone();
    both.load_parameter("M_i_minus", Tensor::zeros(&[4, 6, 2], DType::F32)).unwrap();

    let mut plus_only = layer(&config(false, true, true), &phi);
    plus_only.load_parameter("M_i_plus", m_i).unwrap();
    plus_only.load_parameter("M_j_plus", m_j).unwrap();
    assert!(both.forward(&x).unwrap().allclose(&plus_only.forward(&x).unwrap(), 1e-6, 1e-6));
}

#[test]
fn test_shape_contract_all_configurations() {
    let mut rng = StdRng::seed_from_u64(15);
    let x = Tensor::randn_with(&[3, 8, 6], 1.0, &mut rng);
    for approx in [false, true] {
        for factorize in [false, true] {
            for hankel in [false, true] {
                let cfg = config(approx, factorize, hankel);
                let mut stu = layer(&cfg, &basis(&cfg));
                stu.init_weights(0.2, &mut rng);
                let y = stu.forward(&x).unwrap();
                assert_eq!(y.dims(), &[3, 8, 6], "{:?}", stu);

                let bad = Tensor::ones(&[3, 8, 5]);
                assert!(matches!(stu.forward(&bad), Err(CoreError::ShapeMismatch { .. })));
            }
        }
    }
}

#[test]
fn test_hand_computed_scenario() {
    // B=2, L=8, n=16, d=4, K=4, exact dense, Hankel-L, all-ones M_phi_plus.
    let mut cfg = ModelConfig::tiny();
    cfg.n_embd = 4;
    cfg.n_heads = 1;
    cfg.num_eigh = 2;
    cfg.use_hankel_l = true;
    assert_eq!(cfg.padded_len(), 16);

    // phi[t, k] = 1 iff t == k: filter k is a pure delay of k steps.
    let mut phi = Tensor::zeros(&[8, 4], DType::F32);
    for k in 0..4 {
        phi.set(&[k, k], 1.0).unwrap();
    }
    let mut stu = Stu::new(&cfg, Arc::new(phi), 16).unwrap();
    stu.load_parameter("M_phi_plus", Tensor::ones(&[4, 4, 4])).unwrap();

    let y = stu.forward(&Tensor::ones(&[2, 8, 4])).unwrap();
    assert_eq!(y.dims(), &[2, 8, 4]);
    // U_plus[b, t, k, i] = 1 when t >= k, so out[b, t, o] = 4 * min(t + 1, 4).
    for b in 0..2 {
        for t in 0..8 {
            let want = 4.0 * (t + 1).min(4) as f32;
            for o in 0..4 {
                let got = y.get(&[b, t, o]).unwrap();
                assert!((got - want).abs() < 1e-4, "y[{b},{t},{o}] = {got}, want {want}");
            }
        }
    }
}

#[test]
fn test_fft_convolution_matches_direct_sum() {
    let mut rng = StdRng::seed_from_u64(16);
    let (l, d, k) = (13, 2, 3);
    let signal = Tensor::randn_with(&[1, l, d], 1.0, &mut rng);
    let filters = Tensor::randn_with(&[l, k], 1.0, &mut rng);
    let (plus, minus) = convolve(&signal, &filters, 32, false).unwrap();

    for di in 0..d {
        for ki in 0..k {
            for t in 0..l {
                let mut want_plus = 0.0f32;
                let mut want_minus = 0.0f32;
                for s in 0..=t {
                    let term = filters.get(&[t - s, ki]).unwrap() * signal.get(&[0, s, di]).unwrap();
                    want_plus += term;
                    want_minus += if (t - s) % 2 == 0 { term } else { -term };
                }
                assert!((plus.get(&[0, t, ki, di]).unwrap() - want_plus).abs() < 1e-4);
                assert!((minus.get(&[0, t, ki, di]).unwrap() - want_minus).abs() < 1e-4);
            }
        }
    }
}

#[test]
fn test_construction_errors() {
    let cfg = config(false, false, false);
    let narrow = Arc::new(Tensor::zeros(&[8, 2], DType::F32));
    assert!(matches!(
        Stu::new(&cfg, narrow, 16),
        Err(StuError::FilterWidthMismatch { expected: 4, got: 2 })
    ));

    let mut cfg = config(true, true, false);
    cfg.r = None;
    let phi = basis(&cfg);
    assert!(matches!(Stu::new(&cfg, phi, 16), Err(StuError::InvalidConfig(_))));
}
