mod config;
mod data;
mod features;
mod models;
mod report;
mod risk;
mod sampler;
mod scaler;
mod stats;
mod train;
mod windows;

use clap::Parser;
use config::RunConfig;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "volcast: walk-forward realized-volatility forecasting with Monte Carlo dropout and risk-aware allocation",
    after_help = "EXAMPLES:
    # Run on a wide close/volume CSV
    cargo run --release -- --data prices.csv

    # Synthetic demo panel with custom hyperparameters
    cargo run --release -- --demo-assets 4 --demo-days 400 --epochs 30 --mc-samples 100"
)]
struct Args {
    /// Wide CSV with a date index plus <ASSET>_Close / <ASSET>_Volume columns.
    /// When omitted, a deterministic synthetic panel is generated instead.
    #[arg(long)]
    data: Option<PathBuf>,

    /// Number of assets in the synthetic demo panel
    #[arg(long, default_value_t = 3)]
    demo_assets: usize,

    /// Number of trading days in the synthetic demo panel
    #[arg(long, default_value_t = 400)]
    demo_days: usize,

    /// Where to write the serialized step results
    #[arg(long, default_value = "walkforward_results.json")]
    output: PathBuf,

    /// Forecast horizon in trading days
    #[arg(long, default_value_t = config::HORIZON)]
    horizon: usize,

    /// Encoder input window length in feature rows
    #[arg(long, default_value_t = config::SEQUENCE_LENGTH)]
    sequence_length: usize,

    /// Fraction of windows in the initial training set
    #[arg(long, default_value_t = config::TRAIN_FRACTION)]
    train_fraction: f64,

    /// Mini-batch size (batches are sequential, never shuffled)
    #[arg(long, default_value_t = config::BATCH_SIZE)]
    batch_size: usize,

    /// Maximum training epochs per walk-forward step
    #[arg(long, default_value_t = config::EPOCHS)]
    epochs: usize,

    /// Early stopping patience in epochs
    #[arg(long, default_value_t = config::PATIENCE)]
    patience: usize,

    /// AdamW learning rate
    #[arg(long, default_value_t = config::LEARNING_RATE)]
    learning_rate: f64,

    /// LSTM hidden state width
    #[arg(long, default_value_t = config::HIDDEN_DIM)]
    hidden_size: usize,

    /// Number of stacked LSTM layers
    #[arg(long, default_value_t = config::LSTM_LAYERS)]
    lstm_layers: usize,

    /// Dropout probability (inter-layer and Monte Carlo unit)
    #[arg(long, default_value_t = config::DROPOUT_RATE)]
    dropout: f64,

    /// Stochastic forward passes per prediction
    #[arg(long, default_value_t = config::MC_SAMPLES)]
    mc_samples: usize,

    /// Weight of the directional ranking loss term
    #[arg(long, default_value_t = config::LAMBDA_DIR)]
    lambda_dir: f64,

    /// Base random seed; step t is seeded with seed + t
    #[arg(long, default_value_t = config::BASE_SEED)]
    seed: u64,

    /// Use CUDA GPU acceleration (requires --features cuda at compile time)
    #[arg(long)]
    cuda: bool,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        RunConfig {
            horizon: self.horizon,
            sequence_length: self.sequence_length,
            train_fraction: self.train_fraction,
            batch_size: self.batch_size,
            max_epochs: self.epochs,
            patience: self.patience,
            learning_rate: self.learning_rate,
            hidden_size: self.hidden_size,
            lstm_layers: self.lstm_layers,
            dropout: self.dropout,
            mc_samples: self.mc_samples,
            lambda_dir: self.lambda_dir,
            base_seed: self.seed,
        }
    }
}

fn main() -> anyhow::Result<()> {
    config::init_cpu_parallelism();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("volcast=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    if args.cuda && !cfg!(feature = "cuda") {
        error!(
            "--cuda was requested, but this binary was compiled without CUDA support. Re-run with: cargo run --release --features cuda -- --cuda"
        );
        return Ok(());
    }

    let cfg = args.run_config();
    let device = config::get_device(args.cuda);

    let panel = match &args.data {
        Some(path) => data::load_panel_csv(path)?,
        None => {
            info!(
                "No --data file given; generating a deterministic synthetic panel ({} assets, {} days, seed {})",
                args.demo_assets, args.demo_days, cfg.base_seed
            );
            data::Panel::synthetic(args.demo_assets, args.demo_days, cfg.base_seed)
        }
    };

    let result = train::run_walk_forward(&cfg, &panel, &device)?;

    report::print_summary(&result);
    report::save_report(&args.output, &result)?;
    info!("Results saved: {}", args.output.display());

    Ok(())
}
