use candle_core::Device;
use rayon::ThreadPoolBuilder;
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

pub fn get_device(use_cuda: bool) -> Device {
    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device 0");
                    return device;
                }
                Err(e) => {
                    warn!("Failed to initialize CUDA: {}. Falling back to CPU.", e);
                }
            }
        }
        #[cfg(not(feature = "cuda"))]
        {
            warn!("--cuda flag set but binary was compiled without the 'cuda' feature. Falling back to CPU.");
        }
    }

    #[cfg(feature = "mkl")]
    info!("Using CPU device with Intel MKL BLAS acceleration");

    #[cfg(not(feature = "mkl"))]
    info!("Using CPU device (tip: compile with --features mkl for faster matrix ops)");

    Device::Cpu
}

/// Forecast horizon in trading days; the target at an anchor date is the
/// realized volatility over the `HORIZON` days that follow it.
pub const HORIZON: usize = 7;
/// Number of consecutive feature rows fed to the encoder per window.
pub const SEQUENCE_LENGTH: usize = 35;
/// Fraction of all windows used as the initial training set.
pub const TRAIN_FRACTION: f64 = 0.8;
pub const BATCH_SIZE: usize = 16;
pub const EPOCHS: usize = 50;
pub const PATIENCE: usize = 5;
pub const LEARNING_RATE: f64 = 1e-3;
pub const HIDDEN_DIM: usize = 64;
pub const LSTM_LAYERS: usize = 2;
pub const DROPOUT_RATE: f64 = 0.2;
/// Stochastic forward passes per prediction window.
pub const MC_SAMPLES: usize = 50;
/// Weight of the directional ranking term in the composite loss.
pub const LAMBDA_DIR: f64 = 0.2;
pub const BASE_SEED: u64 = 42;

/// Everything tunable about a walk-forward run. Defaults mirror the constants
/// above; the CLI overrides individual fields.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub horizon: usize,
    pub sequence_length: usize,
    pub train_fraction: f64,
    pub batch_size: usize,
    pub max_epochs: usize,
    pub patience: usize,
    pub learning_rate: f64,
    pub hidden_size: usize,
    pub lstm_layers: usize,
    pub dropout: f64,
    pub mc_samples: usize,
    pub lambda_dir: f64,
    pub base_seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            horizon: HORIZON,
            sequence_length: SEQUENCE_LENGTH,
            train_fraction: TRAIN_FRACTION,
            batch_size: BATCH_SIZE,
            max_epochs: EPOCHS,
            patience: PATIENCE,
            learning_rate: LEARNING_RATE,
            hidden_size: HIDDEN_DIM,
            lstm_layers: LSTM_LAYERS,
            dropout: DROPOUT_RATE,
            mc_samples: MC_SAMPLES,
            lambda_dir: LAMBDA_DIR,
            base_seed: BASE_SEED,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.horizon == 0 {
            anyhow::bail!("horizon must be >= 1");
        }
        if self.sequence_length < 2 {
            anyhow::bail!("sequence length must be >= 2");
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            anyhow::bail!(
                "train fraction must lie in (0, 1), got {}",
                self.train_fraction
            );
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch size must be >= 1");
        }
        if self.max_epochs == 0 {
            anyhow::bail!("max epochs must be >= 1");
        }
        if self.lstm_layers == 0 {
            anyhow::bail!("LSTM layer count must be >= 1");
        }
        if self.mc_samples == 0 {
            anyhow::bail!("Monte Carlo sample count must be >= 1");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("dropout probability must lie in [0, 1), got {}", self.dropout);
        }
        Ok(())
    }
}
