use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingJobId(pub String);

impl TrainingJobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TrainingJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Interval requested energies are drawn from, in GeV.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyRange {
    pub min: f32,
    pub max: f32,
}

impl Default for EnergyRange {
    fn default() -> Self {
        Self { min: 1.0, max: 100.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingHyperParams {
    pub seed: u64,
    pub epochs: u32,
    pub batch_size: usize,
    pub latent_size: usize,
    pub disc_lr: f64,
    pub gen_lr: f64,
    pub adam_beta1: f64,
    /// Discriminator updates pause while the last epoch's generator loss is at or above this.
    pub maintain_gen_loss_below: f32,
    /// Each step runs `2 * train_gen_per_epoch` generator updates.
    pub train_gen_per_epoch: usize,
    /// Epochs during which the discriminator is always updated.
    pub warmup_epochs: u32,
    pub label_flip_prob: f64,
    pub energy_range: EnergyRange,
}

impl Default for TrainingHyperParams {
    fn default() -> Self {
        Self {
            seed: 42,
            epochs: 50,
            batch_size: 256,
            latent_size: 1024,
            disc_lr: 2e-5,
            gen_lr: 2e-4,
            adam_beta1: 0.5,
            maintain_gen_loss_below: 1000.0,
            train_gen_per_epoch: 1,
            warmup_epochs: 10,
            label_flip_prob: 0.3,
            energy_range: EnergyRange::default(),
        }
    }
}

impl TrainingHyperParams {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidSpec("epochs must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidSpec("batch_size must be >= 1".to_string()));
        }
        if self.latent_size == 0 {
            return Err(TrainingError::InvalidSpec("latent_size must be >= 1".to_string()));
        }
        if !self.disc_lr.is_finite() || self.disc_lr <= 0.0 {
            return Err(TrainingError::InvalidSpec("disc_lr must be > 0".to_string()));
        }
        if !self.gen_lr.is_finite() || self.gen_lr <= 0.0 {
            return Err(TrainingError::InvalidSpec("gen_lr must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.adam_beta1) {
            return Err(TrainingError::InvalidSpec("adam_beta1 must be in [0, 1)".to_string()));
        }
        if self.train_gen_per_epoch == 0 {
            return Err(TrainingError::InvalidSpec("train_gen_per_epoch must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.label_flip_prob) {
            return Err(TrainingError::InvalidSpec("label_flip_prob must be in [0, 1]".to_string()));
        }
        let range = self.energy_range;
        if !(range.min.is_finite() && range.max.is_finite()) || range.min <= 0.0 || range.max <= range.min {
            return Err(TrainingError::InvalidSpec(format!(
                "energy_range must satisfy 0 < min < max (got {}..{})",
                range.min, range.max
            )));
        }
        Ok(())
    }
}

/// Where checkpoints live and which of them are read or written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    pub dir: PathBuf,
    pub generator_prefix: String,
    pub discriminator_prefix: String,
    pub combined_prefix: String,
    /// Resume from the newest optimizer-state artifacts (weights of the same epoch follow).
    pub load_model: bool,
    /// Resume from the newest weights artifacts only.
    pub load_weights: bool,
    /// Also write optimizer state when weights are written.
    pub save_model: bool,
    pub save_all_epochs: bool,
    /// Keep consumed artifacts on disk after a resume.
    pub retain_after_load: bool,
    /// Only rank 0 writes, and every rank reads rank 0's artifacts.
    pub single_writer: bool,
    /// Blend factor between the cross-worker mean and the local weights after loading.
    pub weights_averaging_coeff: f32,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            generator_prefix: "params_generator_epoch_".to_string(),
            discriminator_prefix: "params_discriminator_epoch_".to_string(),
            combined_prefix: "params_combined_epoch_".to_string(),
            load_model: false,
            load_weights: false,
            save_model: false,
            save_all_epochs: false,
            retain_after_load: false,
            single_writer: false,
            weights_averaging_coeff: 0.0,
        }
    }
}

impl CheckpointPolicy {
    pub fn validate(&self) -> TrainingResult<()> {
        for (name, prefix) in [
            ("generator_prefix", &self.generator_prefix),
            ("discriminator_prefix", &self.discriminator_prefix),
            ("combined_prefix", &self.combined_prefix),
        ] {
            if prefix.trim().is_empty() {
                return Err(TrainingError::InvalidSpec(format!("{name} must not be empty")));
            }
        }
        if self.generator_prefix == self.discriminator_prefix
            || self.generator_prefix == self.combined_prefix
            || self.discriminator_prefix == self.combined_prefix
        {
            return Err(TrainingError::InvalidSpec("checkpoint prefixes must be distinct".to_string()));
        }
        if !(0.0..=1.0).contains(&self.weights_averaging_coeff) {
            return Err(TrainingError::InvalidSpec(
                "weights_averaging_coeff must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn resume_requested(&self) -> bool {
        self.load_model || self.load_weights
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJobSpec {
    pub job_id: TrainingJobId,
    pub created_at: DateTime<Utc>,
    /// YAML manifest mapping particle class names to data files.
    pub dataset: PathBuf,
    #[serde(default)]
    pub hyperparams: TrainingHyperParams,
    #[serde(default)]
    pub checkpoints: CheckpointPolicy,
}

impl TrainingJobSpec {
    #[must_use]
    pub fn new(dataset: PathBuf) -> Self {
        Self {
            job_id: TrainingJobId::new(),
            created_at: Utc::now(),
            dataset,
            hyperparams: TrainingHyperParams::default(),
            checkpoints: CheckpointPolicy::default(),
        }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.dataset.as_os_str().is_empty() {
            return Err(TrainingError::InvalidSpec("dataset manifest path is required".to_string()));
        }
        self.hyperparams.validate()?;
        self.checkpoints.validate()?;
        Ok(())
    }
}

/// Subset of a job that can be kept in a TOML file; the dataset comes from the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfigFile {
    pub hyperparams: TrainingHyperParams,
    pub checkpoints: CheckpointPolicy,
}

impl TrainingConfigFile {
    pub fn load(path: &Path) -> TrainingResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_spec_defaults_validate() {
        let spec = TrainingJobSpec::new(PathBuf::from("particles.yaml"));
        assert!(spec.validate().is_ok());
        assert_eq!(spec.hyperparams.batch_size, 256);
        assert_eq!(spec.checkpoints.generator_prefix, "params_generator_epoch_");
    }

    #[test]
    fn test_job_spec_validate_requires_dataset() {
        let spec = TrainingJobSpec::new(PathBuf::new());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_averaging_coeff_out_of_range_rejected() {
        let mut spec = TrainingJobSpec::new(PathBuf::from("particles.yaml"));
        spec.checkpoints.weights_averaging_coeff = 1.5;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_duplicate_prefixes_rejected() {
        let mut policy = CheckpointPolicy::default();
        policy.combined_prefix = policy.generator_prefix.clone();
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_config_file_partial_toml() {
        let cfg: TrainingConfigFile = toml::from_str(
            r#"
            [hyperparams]
            batch_size = 64
            maintain_gen_loss_below = 12.5

            [checkpoints]
            save_model = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.hyperparams.batch_size, 64);
        assert_eq!(cfg.hyperparams.latent_size, 1024);
        assert!((cfg.hyperparams.maintain_gen_loss_below - 12.5).abs() < f32::EPSILON);
        assert!(cfg.checkpoints.save_model);
        assert!(!cfg.checkpoints.load_model);
    }
}
