use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tch::Device;

use seq_core::{build_model_pair, checkpoint};
use trainer::{BatchGenerator, Trainer, TrainerConfig};

#[derive(Parser)]
#[command(name = "seq-train", about = "Train a recurrent sequence classifier")]
struct Cli {
    /// YAML training configuration.
    #[arg(short, long, default_value = "configs/train.yaml")]
    config: PathBuf,
    #[arg(long)]
    max_epoch: Option<usize>,
    #[arg(long)]
    passes: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Continue from the newest checkpoint in the model directory.
    #[arg(long)]
    resume: bool,
    /// Train on the CPU even when CUDA is available.
    #[arg(long)]
    cpu: bool,
}

impl Cli {
    fn apply(&self, config: &mut TrainerConfig) {
        if let Some(max_epoch) = self.max_epoch {
            config.max_epoch = max_epoch;
        }
        if let Some(passes) = self.passes {
            config.passes = passes;
        }
        if let Some(lr) = self.learning_rate {
            config.initial_learning_rate = lr;
        }
        if let Some(dir) = &self.model_dir {
            config.model_dir = dir.clone();
        }
        config.resume |= self.resume;
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        TrainerConfig::load(&cli.config)
            .with_context(|| format!("Failed to load training config {:?}", cli.config))?
    } else {
        warn!("{:?} not found, using default configuration", cli.config);
        TrainerConfig::default()
    };
    cli.apply(&mut config);
    config.validate().context("Invalid training configuration")?;

    if let Some(seed) = config.seed {
        tch::manual_seed(seed);
    }

    let device = if cli.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    println!("Using device: {:?}", device);

    let layout = config.data_layout();
    let mut train_batches = BatchGenerator::new(&config.train_datafile, &layout)
        .with_context(|| format!("Failed to load training data {:?}", config.train_datafile))?;
    let mut valid_batches = BatchGenerator::new(&config.valid_datafile, &layout)
        .with_context(|| format!("Failed to load validation data {:?}", config.valid_datafile))?;

    let resume = if config.resume {
        let latest = checkpoint::latest_checkpoint(&config.model_dir)?;
        if latest.is_none() {
            warn!("no checkpoint found in {:?}, starting from scratch", config.model_dir);
        }
        latest
    } else {
        None
    };

    let (train_model, valid_model) = build_model_pair(
        &config.model_config(),
        device,
        resume.as_ref().map(|(_, path)| path.as_path()),
    )
    .context("Failed to build models")?;

    let mut trainer = Trainer::new(config, train_model, valid_model)?;
    if let Some((epoch, path)) = &resume {
        info!("resuming after epoch {} from {:?}", epoch, path);
        trainer = trainer.starting_at(epoch + 1);
        match checkpoint::load_session(path)
            .with_context(|| format!("Failed to read training session from {:?}", path))?
        {
            Some(session) => trainer = trainer.with_session(session.into()),
            None => warn!("{:?} has no training session, restarting the learning-rate schedule", path),
        }
    }

    let reports = trainer.train(&mut train_batches, &mut valid_batches)?;

    println!("Training complete! {} epochs run.", reports.len());
    Ok(())
}
