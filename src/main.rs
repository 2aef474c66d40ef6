use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use crnn::{CrnnConfig, DeviceKind, Recognizer};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crnn")]
#[command(about = "Convolutional recurrent text-line recognizer trained with CTC", long_about = None)]
struct Cli {
    /// Train the model
    #[arg(long)]
    train: bool,

    /// Decode the test split and print transcripts
    #[arg(long)]
    test: bool,

    /// Directory holding checkpoints
    #[arg(short = 'm', long = "model-path")]
    model_path: Option<PathBuf>,

    /// Directory of `<label>_<anything>.<ext>` example images
    #[arg(short = 'e', long = "examples-path")]
    examples_path: Option<PathBuf>,

    /// Fraction of examples used for training
    #[arg(short = 't', long = "train-test-ratio")]
    train_test_ratio: Option<f64>,

    /// Examples per batch
    #[arg(short = 'b', long = "batch-size")]
    batch_size: Option<usize>,

    /// Passes over the training batches
    #[arg(short = 'i', long = "iteration-count")]
    iteration_count: Option<usize>,

    /// Width input images are fitted to
    #[arg(short = 'w', long = "max-image-width")]
    max_image_width: Option<usize>,

    /// Restore the latest checkpoint from the model path
    #[arg(short = 'r', long)]
    restore: bool,

    /// Configuration file (JSON or YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Device to run on (cpu, cuda, metal)
    #[arg(long, env = "CRNN_DEVICE")]
    device: Option<DeviceKind>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Configuration file values overridden by command-line flags
    fn resolve_config(&self) -> Result<CrnnConfig> {
        let mut config = match &self.config {
            Some(path) => CrnnConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration file {}", path.display()))?,
            None => CrnnConfig::default(),
        };

        if let Some(path) = &self.model_path {
            config.training.checkpointing.output_dir = Some(path.clone());
        }
        if let Some(path) = &self.examples_path {
            config.data.examples_path = Some(path.clone());
        }
        if let Some(ratio) = self.train_test_ratio {
            config.data.train_test_ratio = ratio;
        }
        if let Some(batch_size) = self.batch_size {
            config.data.batch_size = batch_size;
        }
        if let Some(count) = self.iteration_count {
            config.training.iteration_count = count;
        }
        if let Some(width) = self.max_image_width {
            config.model.max_image_width = width;
        }
        if self.restore {
            config.training.checkpointing.restore = true;
        }
        if let Some(device) = self.device {
            config.device = device;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let default_directive = match verbose {
        0 => "crnn=info",
        1 => "crnn=debug",
        _ => "crnn=trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if !cli.train && !cli.test {
        println!("Nothing to do: pass --train and/or --test (see --help)");
        return Ok(());
    }

    let config = cli.resolve_config()?;
    config
        .model_path()
        .context("Pass --model-path or set training.checkpointing.output_dir")?;
    config
        .examples_path()
        .context("Pass --examples-path or set data.examples_path")?;

    if cli.test && !cli.train && !config.training.checkpointing.restore {
        warn!("Testing without --restore decodes with freshly initialized weights");
    }

    let mut recognizer =
        Recognizer::new(config.clone()).context("Failed to initialize the recognizer")?;

    // Without training every example is a test example
    let ratio = if cli.train {
        config.data.train_test_ratio
    } else {
        0.0
    };
    let data = recognizer
        .load_data(ratio)
        .context("Failed to load examples")?;

    if cli.train {
        let summary = recognizer.train(&data).context("Training failed")?;
        info!(
            "Trained {} iterations ({} batches); now at step {}",
            summary.iterations.len(),
            summary.batches,
            summary.final_step
        );
    }

    if cli.test {
        let summary = recognizer.test(&data).context("Testing failed")?;
        info!(
            "{} of {} examples exact, mean edit distance {:.4}",
            summary.exact_matches, summary.examples, summary.mean_edit_distance
        );
    }

    recognizer.close();
    Ok(())
}
