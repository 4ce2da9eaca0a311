//! Recurrent Attention Walkthrough
//!
//! Runs the recurrent attention layer over a batch of random sequences,
//! prints where each step attends, runs one backward pass, and round-trips
//! the layer through a checkpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example 03_recurrent_attention
//! cargo run --release --example 03_recurrent_attention -- --n-in 8 --n-out 4 --time 10 --config layer.json
//! ```

use additive_attention::{Checkpoint, LayerConfig, RecurrentAttentionLayer, Result, SequenceLayout, Tensor};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

#[derive(Parser)]
#[command(name = "03_recurrent_attention", about = "Recurrent attention forward/backward walkthrough")]
struct Args {
    #[arg(long, default_value_t = 4)]
    n_in: usize,

    #[arg(long, default_value_t = 3)]
    n_out: usize,

    #[arg(long, default_value_t = 5)]
    time: usize,

    #[arg(long, default_value_t = 2)]
    batch: usize,

    /// Load the layer configuration from a JSON file instead
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => LayerConfig::load(path)?,
        None => LayerConfig::new(args.n_in, args.n_out)
            .with_input_layout(SequenceLayout::BatchTimeFeatures)
            .with_seed(args.seed),
    };
    println!("Configuration:\n{}", config.to_json()?);

    let n_in = config.n_in;
    let layout = config.input_layout;
    let mut layer = RecurrentAttentionLayer::new(config)?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let shape = layout.external_shape(n_in, args.time, args.batch);
    let len: usize = shape.iter().product();
    let x = Tensor::new((0..len).map(|_| rng.random_range(-1.0f32..1.0)).collect(), shape);

    // The last step of the first sequence is padding
    let mut mask = Tensor::full(vec![args.batch, args.time], 1.0);
    mask.data[args.time - 1] = 0.0;
    layer.feed_forward_mask(Some(mask));

    let y = layer.activate(&x, true)?;
    println!("\nInput {:?} -> output {:?}", x.shape, y.shape);

    for t in 0..args.time {
        if let Some(weights) = layer.attention_weights(t) {
            let first: Vec<String> = weights.data[..args.time].iter().map(|a| format!("{a:.3}")).collect();
            println!("step {t}: attention of sequence 0 = [{}]", first.join(", "));
        }
    }

    let (grad, dx) = layer.backprop_gradient(&Tensor::full(y.shape.clone(), 1.0))?;
    for (key, view) in grad.iter() {
        let norm = view.data.iter().map(|g| g * g).sum::<f32>().sqrt();
        println!("  d{key:<4} {:?} norm {norm:.4}", view.shape);
    }
    info!(input_grad = ?dx.shape, total_norm = grad.norm(), "backward done");

    let path = std::env::temp_dir().join("recurrent_attention_demo.ckpt");
    Checkpoint::from(&layer).save(&path)?;
    let restored = Checkpoint::load(&path)?.into_recurrent_attention()?;
    std::fs::remove_file(&path)?;
    println!("\nCheckpoint round trip preserved parameters: {}", restored.params() == layer.params());
    Ok(())
}
