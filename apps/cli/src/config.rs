//! CLI configuration loading and merging.
//!
//! Configuration precedence:
//! 1. CLI arguments
//! 2. `--config` TOML file (`[hyperparams]`, `[checkpoints]`, `[model]`)
//! 3. Defaults

use crate::Args;
use anyhow::{Context, Result};
use calogan_models::ModelConfig;
use calogan_training::{TrainingConfigFile, TrainingJobSpec};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Contents of a `--config` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(flatten)]
    pub training: TrainingConfigFile,
    #[serde(default)]
    pub model: ModelConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// Everything a run needs, after merging.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub job: TrainingJobSpec,
    pub model: ModelConfig,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// Switches only ever turn a setting on.
fn enable(slot: &mut bool, flag: bool) {
    if flag {
        *slot = true;
    }
}

pub fn resolve(args: &Args) -> Result<ResolvedConfig> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let FileConfig { training, mut model } = file;
    let TrainingConfigFile { mut hyperparams, mut checkpoints } = training;

    set(&mut hyperparams.epochs, args.nb_epochs);
    set(&mut hyperparams.batch_size, args.batch_size);
    set(&mut hyperparams.latent_size, args.latent_size);
    set(&mut hyperparams.disc_lr, args.disc_lr);
    set(&mut hyperparams.gen_lr, args.gen_lr);
    set(&mut hyperparams.adam_beta1, args.adam_beta);
    set(&mut hyperparams.maintain_gen_loss_below, args.maintain_gen_loss_below);
    set(&mut hyperparams.train_gen_per_epoch, args.train_gen_per_epoch);
    set(&mut hyperparams.seed, args.seed);

    set(&mut checkpoints.dir, args.checkpoint_dir.clone());
    set(&mut checkpoints.generator_prefix, args.g_pfx.clone());
    set(&mut checkpoints.discriminator_prefix, args.d_pfx.clone());
    set(&mut checkpoints.combined_prefix, args.c_pfx.clone());
    set(&mut checkpoints.weights_averaging_coeff, args.weights_averaging_coeff);
    enable(&mut checkpoints.load_model, args.load_model);
    enable(&mut checkpoints.load_weights, args.load_weights);
    enable(&mut checkpoints.save_model, args.save_model);
    enable(&mut checkpoints.save_all_epochs, args.save_all_epochs);
    enable(&mut checkpoints.retain_after_load, args.no_delete);
    enable(&mut checkpoints.single_writer, args.process0);

    if args.no_attn {
        model.attention = false;
    }
    set(&mut model.last_activation, args.last_activation);

    let mut job = TrainingJobSpec::new(args.dataset.clone());
    job.hyperparams = hyperparams;
    job.checkpoints = checkpoints;
    job.validate().context("Invalid training configuration")?;
    model.validate().context("Invalid model configuration")?;

    Ok(ResolvedConfig { job, model })
}
