use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rusty_vit::nn::ForwardCtx;
use rusty_vit::tensor::MATMUL_TIME_NS;
use rusty_vit::{Module, Tensor, ViT, ViTConfig};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Runs one Vision Transformer forward pass on a synthetic image batch.
#[derive(Parser, Debug)]
#[command(name = "vit_forward", version, about)]
struct Args {
    /// JSON model config; missing fields take the ViT-Base defaults
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Seed for weights, input and dropout
    #[arg(long)]
    seed: Option<u64>,

    /// Run in training mode (dropout active)
    #[arg(long)]
    train: bool,

    /// Fill every pixel with this value
    #[arg(long, default_value_t = 0.0, conflicts_with = "random_input")]
    fill: f32,

    /// Uniform random pixels instead of a constant fill
    #[arg(long)]
    random_input: bool,

    /// Classes to print per image
    #[arg(long, default_value_t = 5)]
    top_k: usize,
}

fn top_k(row: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k);
    ranked
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.batch_size == 0 {
        bail!("--batch-size must be at least 1");
    }

    println!("--- RustyViT Forward Pass ---");

    println!("\n[Step 1: Model Configuration]");
    let config = match &args.config {
        Some(path) => ViTConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ViTConfig::default(),
    };
    println!("  - Image: {}x{}x{}", config.in_channels, config.image_size, config.image_size);
    println!("  - Patch Size: {} ({} patches)", config.patch_size, config.num_patches());
    println!("  - Embedding Width: {}", config.embedding_width);
    println!("  - Depth: {}", config.depth);
    println!("  - Heads: {}", config.num_heads);
    println!("  - Classes: {}", config.num_classes);

    println!("\n[Step 2: Instantiate Model]");
    let start = Instant::now();
    let model = match args.seed {
        Some(seed) => ViT::from_seed(config.clone(), seed),
        None => ViT::new(config.clone()),
    }
    .context("invalid model configuration")?;
    println!(
        "  - {} parameters initialised in {:?}.",
        model.num_parameters(),
        start.elapsed()
    );

    println!("\n[Step 3: Input Batch]");
    let shape = vec![
        args.batch_size,
        config.in_channels,
        config.image_size,
        config.image_size,
    ];
    let images = if args.random_input {
        match args.seed {
            Some(seed) => Tensor::rand_with(shape, &mut StdRng::seed_from_u64(seed.wrapping_add(1))),
            None => Tensor::rand(shape),
        }
    } else {
        Tensor::full(shape, args.fill)
    };
    println!("  - Images: {:?}", images.shape());

    println!("\n[Step 4: Forward Pass]");
    let mut ctx = match (args.train, args.seed) {
        (true, Some(seed)) => ForwardCtx::train_seeded(seed),
        (true, None) => ForwardCtx::train(),
        (false, _) => ForwardCtx::eval(),
    };
    println!("  - Mode: {:?}", ctx.mode());

    MATMUL_TIME_NS.store(0, Ordering::Relaxed);
    let start = Instant::now();
    let logits = model.forward_with(&images, &mut ctx)?;
    let elapsed = start.elapsed();
    println!("  - Logits: {:?}", logits.shape());

    for (i, row) in logits.data().outer_iter().enumerate() {
        let row: Vec<f32> = row.iter().copied().collect();
        let ranked = top_k(&row, args.top_k)
            .into_iter()
            .map(|(class, score)| format!("{}:{:.4}", class, score))
            .collect::<Vec<_>>()
            .join(" ");
        println!("  - Image {}: {}", i, ranked);
    }

    println!("\n[Step 5: Profiling Report]");
    let matmul_secs = MATMUL_TIME_NS.load(Ordering::Relaxed) as f64 / 1e9;
    let total_secs = elapsed.as_secs_f64();
    println!("  - Forward pass: {:.4}s", total_secs);
    if total_secs > 0.0 {
        println!(
            "  - Matmul: {:.4}s ({:.1}% of forward)",
            matmul_secs,
            100.0 * matmul_secs / total_secs
        );
    }

    Ok(())
}
