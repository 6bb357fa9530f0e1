//! RNN-T loss example
//!
//! Builds random encoder and prediction network outputs, computes the simple,
//! full and pruned transducer losses, then trains a small joiner on the pruned
//! loss for a few steps.
//!
//! ```bash
//! cargo run --example rnnt_loss --release -- --batch 4 --frames 50 --symbols 12
//!
//! # Read the loss configuration from a JSON file
//! cargo run --example rnnt_loss --release -- --config loss.json
//!
//! # Run on CPU with a chrome trace written to the current directory
//! cargo run --example rnnt_loss --release -- --cpu --tracing
//! ```

use anyhow::Result;
use candle::{DType, Device, Module, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap, SGD};
use clap::Parser;
use rand::prelude::*;

use candle_transducer::{pruning, Reduction, RnntLoss, RnntLossConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "RNN-T loss with pruning on random inputs")]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Number of sequences in the batch.
    #[arg(long, default_value_t = 2)]
    batch: usize,

    /// Number of encoder frames per sequence.
    #[arg(long, default_value_t = 20)]
    frames: usize,

    /// Number of symbols per sequence.
    #[arg(long, default_value_t = 8)]
    symbols: usize,

    /// Vocabulary size, including the termination symbol.
    #[arg(long, default_value_t = 16)]
    classes: usize,

    /// Symbol positions kept per frame on the pruned path.
    #[arg(long, default_value_t = 4)]
    prune_range: usize,

    /// Seed for the random inputs.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    /// JSON loss configuration, overrides --prune-range.
    #[arg(long)]
    config: Option<String>,

    /// Number of SGD steps on the joiner.
    #[arg(long, default_value_t = 10)]
    steps: usize,

    #[arg(long, default_value_t = 0.1)]
    learning_rate: f64,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

fn random_tensor(dims: (usize, usize, usize), rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let (d0, d1, d2) = dims;
    let data: Vec<f32> = (0..d0 * d1 * d2).map(|_| rng.random::<f32>() * 2. - 1.).collect();
    Ok(Tensor::from_vec(data, dims, device)?)
}

/// Symbol ids in `[0, classes)`, never equal to the termination symbol.
fn random_symbols(args: &Args, termination_symbol: u32, rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let data: Vec<u32> = (0..args.batch * args.symbols)
        .map(|_| {
            let id = rng.random_range(0..args.classes as u32 - 1);
            if id >= termination_symbol {
                id + 1
            } else {
                id
            }
        })
        .collect();
    Ok(Tensor::from_vec(data, (args.batch, args.symbols), device)?)
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();

    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };

    if args.classes < 2 {
        anyhow::bail!("--classes must be at least 2, got {}", args.classes)
    }
    let device = candle_examples::device(args.cpu)?;
    println!("Using device: {:?}", device);

    let config = match &args.config {
        Some(path) => candle_examples::load_loss_config(path)?,
        None => RnntLossConfig::new(0)
            .with_prune_range(args.prune_range)
            .with_reduction(Reduction::Mean),
    };
    println!("Loss config: {:?}", config);
    let termination_symbol = config.termination_symbol;
    let loss = RnntLoss::new(config);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let (b, t, s, c) = (args.batch, args.frames, args.symbols, args.classes);
    let am = random_tensor((b, t, c), &mut rng, &device)?;
    let lm = random_tensor((b, s + 1, c), &mut rng, &device)?;
    let symbols = random_symbols(&args, termination_symbol, &mut rng, &device)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let joiner = candle_nn::linear(c, c, vb.pp("joiner"))?;

    let start = std::time::Instant::now();
    let (simple, ranges) = loss.simple_with_ranges(&lm, &am, &symbols, None)?;
    println!("simple loss: {}", simple);

    let full_joint = am.unsqueeze(2)?.broadcast_add(&lm.unsqueeze(1)?)?.tanh()?;
    let full = loss.full(&joiner.forward(&full_joint)?, &symbols, None)?;
    println!("full loss: {}", full);

    let (am_pruned, lm_pruned) = pruning(&am, &lm, &ranges)?;
    let pruned_input = (am_pruned + lm_pruned)?.tanh()?;
    let pruned = loss.pruned(&joiner.forward(&pruned_input)?, &symbols, &ranges, None)?;
    println!("pruned loss: {}", pruned);
    println!("computed in {:?}", start.elapsed());

    let starts: Vec<i64> = ranges.get(0)?.narrow(1, 0, 1)?.squeeze(1)?.to_vec1()?;
    println!("window starts of sequence 0: {:?}", starts);

    let mut sgd = SGD::new(varmap.all_vars(), args.learning_rate)?;
    for step in 0..args.steps {
        let joint = joiner.forward(&pruned_input)?;
        let objective = loss.pruned(&joint, &symbols, &ranges, None)?.neg()?.mean_all()?;
        sgd.backward_step(&objective)?;
        println!("step {step}: objective {:.5}", objective.to_scalar::<f32>()?);
    }
    Ok(())
}
