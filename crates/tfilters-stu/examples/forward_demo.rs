//! Spectral Transformer forward pass demo.
//!
//! Builds one model per STU parameterisation, runs a batch of tokens
//! through it, and reports the engine, parameter count and timing.
//!
//! Run with:
//!   RUST_LOG=debug cargo run -p tfilters-stu --example forward_demo --release

use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tfilters_stu::{init_tracing, Layer, LayerPattern, ModelConfig, Transformer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let base = ModelConfig {
        n_embd: 32,
        n_heads: 4,
        n_layers: 4,
        seq_len: 64,
        vocab_size: 256,
        num_eigh: 4,
        r: Some(8),
        use_flash_fft: true,
        layer_pattern: LayerPattern::Alternating,
        ..ModelConfig::tiny()
    };

    let batch = 2;
    let tokens: Vec<usize> = (0..batch * base.seq_len).map(|i| (i * 31) % base.vocab_size).collect();

    println!("{:<20} {:>10} {:>12} {:>10}", "variant", "engine", "params", "ms");
    for (use_approx, factorize) in [(false, false), (false, true), (true, false), (true, true)] {
        let cfg = ModelConfig {
            use_approx,
            factorize,
            ..base.clone()
        };
        let model = Transformer::with_rng(cfg, &mut StdRng::seed_from_u64(0))?;
        let Some(Layer::Stu(first)) = model.layers.first() else {
            continue;
        };

        let start = Instant::now();
        let logits = model.forward(&tokens, batch, base.seq_len)?;
        let elapsed = start.elapsed();

        println!(
            "{:<20} {:>10} {:>12} {:>10.2}",
            first.stu.params().variant_name(),
            first.stu.engine_name(),
            model.num_params(),
            elapsed.as_secs_f64() * 1e3,
        );
        debug_assert_eq!(logits.dims(), &[batch, base.seq_len, base.vocab_size]);
    }
    Ok(())
}
