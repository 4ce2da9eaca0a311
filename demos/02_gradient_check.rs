//! Gradient Check
//!
//! Compares every analytic gradient the layers produce with central
//! differences, for each activation and both layers, with and without a
//! mask.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example 02_gradient_check
//! cargo run --release --example 02_gradient_check -- --epsilon 0.005 --tolerance 0.01
//! ```

use additive_attention::gradcheck::check_gradient;
use additive_attention::{
    Activation, AttentionError, LayerConfig, RecurrentAttentionLayer, Result, SelfAttentionLayer, Tensor, WeightInit,
};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Parser)]
#[command(name = "02_gradient_check", about = "Check attention gradients numerically")]
struct Args {
    /// Central-difference step
    #[arg(long, default_value_t = 1e-2)]
    epsilon: f32,

    /// Largest accepted error
    #[arg(long, default_value_t = 5e-3)]
    tolerance: f32,

    #[arg(long, default_value_t = 3)]
    n_in: usize,

    #[arg(long, default_value_t = 2)]
    n_out: usize,

    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn random_tensor(shape: Vec<usize>, rng: &mut StdRng) -> Tensor {
    let len: usize = shape.iter().product();
    Tensor::new((0..len).map(|_| rng.random_range(-1.0f32..1.0)).collect(), shape)
}

/// The two layers behind one interface for this check
enum Layer {
    Pooling(SelfAttentionLayer),
    Recurrent(RecurrentAttentionLayer),
}

impl Layer {
    fn build(recurrent: bool, config: LayerConfig, params: Option<Vec<f32>>) -> Result<Self> {
        Ok(match (recurrent, params) {
            (false, None) => Layer::Pooling(SelfAttentionLayer::new(config)?),
            (false, Some(p)) => Layer::Pooling(SelfAttentionLayer::from_params(config, p)?),
            (true, None) => Layer::Recurrent(RecurrentAttentionLayer::new(config)?),
            (true, Some(p)) => Layer::Recurrent(RecurrentAttentionLayer::from_params(config, p)?),
        })
    }

    fn params(&self) -> &[f32] {
        match self {
            Layer::Pooling(l) => l.params(),
            Layer::Recurrent(l) => l.params(),
        }
    }

    fn run(&mut self, x: &Tensor, mask: Option<&Tensor>, training: bool) -> Result<Tensor> {
        match self {
            Layer::Pooling(l) => {
                l.feed_forward_mask(mask.cloned());
                l.activate(x, training)
            }
            Layer::Recurrent(l) => {
                l.feed_forward_mask(mask.cloned());
                l.activate(x, training)
            }
        }
    }

    fn backprop(&mut self, epsilon: &Tensor) -> Result<(Vec<f32>, Tensor)> {
        let (grad, dx) = match self {
            Layer::Pooling(l) => l.backprop_gradient(epsilon)?,
            Layer::Recurrent(l) => l.backprop_gradient(epsilon)?,
        };
        Ok((grad.into_vec(), dx))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).init();
    let args = Args::parse();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let (batch, time) = (2, 4);

    println!("\n{}", "=".repeat(70));
    println!("  Gradient Check (ε = {}, tolerance = {})", args.epsilon, args.tolerance);
    println!("{}", "=".repeat(70));

    let mut failures = 0;
    for recurrent in [false, true] {
        for activation in [
            Activation::Identity,
            Activation::Tanh,
            Activation::Sigmoid,
            Activation::Softsign,
            Activation::Gelu,
        ] {
            for masked in [false, true] {
                let config = LayerConfig::new(args.n_in, args.n_out)
                    .with_activation(activation)
                    .with_bias_init(WeightInit::Uniform)
                    .with_seed(args.seed);
                let x = random_tensor(vec![batch, args.n_in, time], &mut rng);
                let mask = masked.then(|| Tensor::new(vec![1.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0], vec![batch, time]));

                let mut layer = Layer::build(recurrent, config.clone(), None)?;
                let out = layer.run(&x, mask.as_ref(), true)?;
                let g = random_tensor(out.shape.clone(), &mut rng);
                let (grad, dx) = layer.backprop(&g)?;
                let params = layer.params().to_vec();

                let loss = |p: &[f32], input: &Tensor| -> Result<f32> {
                    let mut probe = Layer::build(recurrent, config.clone(), Some(p.to_vec()))?;
                    Ok(probe.run(input, mask.as_ref(), false)?.dot(&g))
                };
                let params_report = check_gradient(|p| loss(p, &x), &params, &grad, args.epsilon)?;
                let input_report = check_gradient(
                    |data| loss(&params, &Tensor::try_new(data.to_vec(), x.shape.clone())?),
                    &x.data,
                    &dx.data,
                    args.epsilon,
                )?;

                let ok = params_report.passed(args.tolerance) && input_report.passed(args.tolerance);
                if !ok {
                    failures += 1;
                }
                println!(
                    "{:<10} {:<9} mask={:<5} params {:.2e}  input {:.2e}  {}",
                    if recurrent { "recurrent" } else { "pooling" },
                    activation.name(),
                    masked,
                    params_report.max_error,
                    input_report.max_error,
                    if ok { "ok" } else { "FAIL" }
                );
            }
        }
    }

    if failures > 0 {
        return Err(AttentionError::InvalidState("gradient check failed"));
    }
    println!("\nAll gradients agree.");
    Ok(())
}
