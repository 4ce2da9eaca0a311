//! Attention Pooling on a Toy Retrieval Task
//!
//! Every sequence has one "marker" step whose first feature is large. The
//! target is the second feature at that step, so a layer that learns to put
//! its attention on the marker solves the task exactly.
//!
//! Training uses plain SGD on the flat parameter buffer:
//!
//! ```text
//! loss = mean((pooled - target)²)
//! params -= lr · clip(grad)
//! ```
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example 01_attention_pooling
//! cargo run --release --example 01_attention_pooling -- --steps 500 --lr 0.5 --save pooling.ckpt
//! ```

use additive_attention::{Activation, Checkpoint, LayerConfig, Result, SelfAttentionLayer, Tensor};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

#[derive(Parser)]
#[command(name = "01_attention_pooling", about = "Train additive attention pooling on a toy task")]
struct Args {
    /// Training steps
    #[arg(long, default_value_t = 300)]
    steps: usize,

    /// Learning rate
    #[arg(long, default_value_t = 0.3)]
    lr: f32,

    /// Sequences per batch
    #[arg(long, default_value_t = 16)]
    batch: usize,

    /// Timesteps per sequence
    #[arg(long, default_value_t = 6)]
    time: usize,

    /// Gradient clipping threshold
    #[arg(long, default_value_t = 1.0)]
    clip: f32,

    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Write the trained layer here
    #[arg(long)]
    save: Option<String>,
}

/// `[batch, 2, time]` inputs with one marker per sequence, and `[batch]` targets
fn make_batch(rng: &mut StdRng, batch: usize, time: usize) -> (Tensor, Vec<f32>) {
    let mut data = vec![0.0; batch * 2 * time];
    let mut targets = Vec::with_capacity(batch);
    for e in 0..batch {
        let marker = rng.random_range(0..time);
        for t in 0..time {
            data[(e * 2) * time + t] = if t == marker { 2.0 } else { rng.random_range(-0.5..0.5) };
            data[(e * 2 + 1) * time + t] = rng.random_range(-1.0..1.0);
        }
        targets.push(data[(e * 2 + 1) * time + marker]);
    }
    (Tensor::new(data, vec![batch, 2, time]), targets)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
    let args = Args::parse();

    println!("\n{}", "=".repeat(70));
    println!("  Additive Attention Pooling");
    println!("{}", "=".repeat(70));

    let config = LayerConfig::new(2, 1).with_activation(Activation::Tanh).with_seed(args.seed);
    let mut layer = SelfAttentionLayer::new(config)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    println!("Parameters: {}", layer.num_params());

    for step in 0..args.steps {
        let (x, targets) = make_batch(&mut rng, args.batch, args.time);
        let pooled = layer.activate(&x, true)?;

        // Only the second pooled feature is compared with the target
        let mut epsilon = Tensor::zeros(pooled.shape.clone());
        let mut loss = 0.0;
        for (e, target) in targets.iter().enumerate() {
            let diff = pooled.data[e * 2 + 1] - target;
            loss += diff * diff;
            epsilon.data[e * 2 + 1] = 2.0 * diff / args.batch as f32;
        }
        loss /= args.batch as f32;

        let (mut grad, _) = layer.backprop_gradient(&epsilon)?;
        let norm = grad.clip(args.clip);
        for (p, g) in layer.params_mut().iter_mut().zip(grad.as_slice()) {
            *p -= args.lr * g;
        }

        if step % 50 == 0 || step + 1 == args.steps {
            info!(step, loss, grad_norm = norm, "training");
        }
    }

    // Inspect where the trained layer looks
    let (x, targets) = make_batch(&mut rng, 1, args.time);
    let pooled = layer.activate(&x, true)?;
    if let Some(weights) = layer.attention_weights() {
        println!("\nMarker row:        {:?}", &x.data[..args.time]);
        println!("Attention weights: {:?}", weights.data);
    }
    println!("Target {:.4}, pooled {:.4}", targets[0], pooled.data[1]);
    layer.clear_state();

    if let Some(path) = args.save {
        Checkpoint::from(&layer).save(path)?;
    }
    Ok(())
}
