//! CaloGAN CLI - train conditional calorimeter-shower GANs
//!
//! Provides the `calogan` command: resolves the run configuration, sets up
//! logging and launches one or more local training workers.

mod config;
mod launch;
mod progress;

use anyhow::Result;
use calogan_models::LastActivation;
use calogan_training::TrainingManifest;
use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Run CaloGAN training.
///
/// Sensible defaults come from arXiv:1511.06434. Every flag overrides the
/// matching entry of `--config`.
#[derive(Parser, Debug)]
#[command(name = "calogan", author, version, about = "Train a conditional calorimeter-shower GAN")]
pub struct Args {
    /// YAML file mapping particle names to data files
    pub dataset: PathBuf,

    /// TOML file with [hyperparams], [checkpoints] and [model] tables
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of epochs to train for
    #[arg(long)]
    pub nb_epochs: Option<u32>,

    /// Batch size per update
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Size of the N(0, 1) latent space to sample
    #[arg(long)]
    pub latent_size: Option<usize>,

    /// Adam learning rate for the discriminator
    #[arg(long)]
    pub disc_lr: Option<f64>,

    /// Adam learning rate for the generator
    #[arg(long)]
    pub gen_lr: Option<f64>,

    /// Adam beta_1
    #[arg(long)]
    pub adam_beta: Option<f64>,

    /// Blend loaded weights with the worker mean (0: keep own, 1: plain mean)
    #[arg(long)]
    pub weights_averaging_coeff: Option<f32>,

    /// Pause discriminator updates while the generator loss is at or above this
    #[arg(long)]
    pub maintain_gen_loss_below: Option<f32>,

    /// Train the generator 2n times per batch
    #[arg(long)]
    pub train_gen_per_epoch: Option<usize>,

    /// Base random seed; worker r uses seed + r
    #[arg(long)]
    pub seed: Option<u64>,

    /// Last generator activation (none, softplus, leakyrelu)
    #[arg(long)]
    pub last_activation: Option<LastActivation>,

    /// Turn off the layer-to-layer attention
    #[arg(long)]
    pub no_attn: bool,

    /// Directory holding checkpoint files
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Prefix for discriminator checkpoint files
    #[arg(long)]
    pub d_pfx: Option<String>,

    /// Prefix for generator checkpoint files
    #[arg(long)]
    pub g_pfx: Option<String>,

    /// Prefix for combined-model checkpoint files
    #[arg(long)]
    pub c_pfx: Option<String>,

    /// Resume from the most recent .optimizer files
    #[arg(long)]
    pub load_model: bool,

    /// Resume from the most recent .weights files
    #[arg(long)]
    pub load_weights: bool,

    /// Also save optimizer state when saving weights
    #[arg(long)]
    pub save_model: bool,

    /// Save at every epoch instead of only the last
    #[arg(long)]
    pub save_all_epochs: bool,

    /// Keep checkpoint files after loading them
    #[arg(long)]
    pub no_delete: bool,

    /// Save and load checkpoints only from worker 0
    #[arg(long)]
    pub process0: bool,

    /// Number of local workers
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Show a progress bar
    #[arg(long)]
    pub prog_bar: bool,

    /// Print the resolved configuration as TOML and exit
    #[arg(long)]
    pub print_config: bool,

    /// Print training manifests as JSON
    #[arg(long)]
    pub json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Shorthand for --log-level debug
    #[arg(long)]
    pub debug: bool,
}

#[derive(Serialize)]
struct PrintedConfig<'a> {
    dataset: &'a PathBuf,
    hyperparams: &'a calogan_training::TrainingHyperParams,
    checkpoints: &'a calogan_training::CheckpointPolicy,
    model: &'a calogan_models::ModelConfig,
}

fn print_summary(manifests: &[TrainingManifest]) {
    let Some(first) = manifests.first() else {
        return;
    };
    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Job:     {}", first.job_id.0.cyan());
    println!("  Workers: {}", first.world_size);
    if let Some(last) = first.metrics.epochs.last() {
        println!("  Epochs:  {} (last {})", first.metrics.epochs.len(), last.epoch);
        println!("  Generator loss: {}", last.generator.to_string().dimmed());
    }
    if let Some(epoch) = first.metrics.resumed_from {
        println!("  Resumed from epoch {epoch}");
    }
    let artifacts: usize = manifests.iter().map(|m| m.artifacts.len()).sum();
    println!("  Artifacts written: {artifacts}");
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug {
        Level::DEBUG
    } else {
        match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };
    let subscriber =
        FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).with_writer(std::io::stderr).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let resolved = config::resolve(&args)?;
    if args.print_config {
        let printed = PrintedConfig {
            dataset: &resolved.job.dataset,
            hyperparams: &resolved.job.hyperparams,
            checkpoints: &resolved.job.checkpoints,
            model: &resolved.model,
        };
        print!("{}", toml::to_string(&printed)?);
        return Ok(());
    }

    let manifests = launch::launch(resolved, args.workers, args.prog_bar).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&manifests)?);
    } else {
        print_summary(&manifests);
    }
    Ok(())
}
