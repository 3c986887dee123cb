//! The adversarial schedule: per-step alternation between the discriminator
//! and the generator, and the loss gate that can freeze the discriminator.

use crate::context::TrainingContext;
use crate::dataset::{GanMode, RealBatch, ShowerDataset, ShowerImages};
use crate::error::{TrainingError, TrainingResult};
use crate::job::{EnergyRange, TrainingHyperParams};
use crate::model::{DiscriminatorBatch, GanModels, GeneratorInput, Inference, Trainable};
use crate::progress::ProgressEvent;
use crate::targets::{LossVector, LossWeights, fake_targets, real_targets, sample_generator_input, trick_targets};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Decides whether the discriminator is updated during an epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscriminatorGate {
    /// Generator loss at or above which the discriminator is frozen.
    pub ceiling: f32,
    /// Epochs before which the gate is always open.
    pub warmup_epochs: u32,
}

impl DiscriminatorGate {
    #[must_use]
    pub fn new(ceiling: f32, warmup_epochs: u32) -> Self {
        Self { ceiling, warmup_epochs }
    }

    /// Open with no recorded generator loss, with a loss below the ceiling, or during warm-up.
    #[must_use]
    pub fn is_open(&self, epoch: u32, last_gen_loss: Option<f32>) -> bool {
        match last_gen_loss {
            None => true,
            Some(loss) => loss < self.ceiling || epoch < self.warmup_epochs,
        }
    }
}

/// Losses of a single training step, already averaged across workers.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLosses {
    /// Mean of the real and fake updates; `None` when the gate was closed.
    pub discriminator: Option<LossVector>,
    /// Mean over the generator repetitions.
    pub generator: LossVector,
}

/// Outcome of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: u32,
    pub steps: usize,
    pub discriminator_updates: usize,
    pub generator: LossVector,
    pub discriminator: Option<LossVector>,
}

#[derive(Debug, Clone)]
pub struct AdversarialScheduler {
    mode: GanMode,
    weights: LossWeights,
    gate: DiscriminatorGate,
    batch_size: usize,
    latent_size: usize,
    energy_range: EnergyRange,
    label_flip_prob: f64,
    generator_updates: usize,
}

impl AdversarialScheduler {
    #[must_use]
    pub fn new(mode: GanMode, hp: &TrainingHyperParams) -> Self {
        Self {
            mode,
            weights: LossWeights::for_mode(mode),
            gate: DiscriminatorGate::new(hp.maintain_gen_loss_below, hp.warmup_epochs),
            batch_size: hp.batch_size,
            latent_size: hp.latent_size,
            energy_range: hp.energy_range,
            label_flip_prob: hp.label_flip_prob,
            generator_updates: 2 * hp.train_gen_per_epoch,
        }
    }

    #[must_use]
    pub fn gate(&self) -> DiscriminatorGate {
        self.gate
    }

    #[must_use]
    pub fn generator_updates(&self) -> usize {
        self.generator_updates
    }

    fn sample_request(&self, ctx: &mut TrainingContext) -> GeneratorInput {
        sample_generator_input(self.mode, self.batch_size, self.latent_size, self.energy_range, &mut ctx.rng)
    }

    /// One step on one real batch: generate, gated real-then-fake discriminator
    /// updates, then the generator trick updates.
    pub fn train_step<G, D, C>(
        &self,
        models: &mut GanModels<G, D, C>,
        batch: &RealBatch,
        gate_open: bool,
        ctx: &mut TrainingContext,
    ) -> TrainingResult<StepLosses>
    where
        G: Inference<Input = GeneratorInput, Output = ShowerImages>,
        D: Trainable<Input = DiscriminatorBatch>,
        C: Trainable<Input = GeneratorInput>,
    {
        let request = self.sample_request(ctx);
        let generated = models.generator.infer(&request)?;
        if generated.len() != request.len() {
            return Err(TrainingError::Shape(format!(
                "generator returned {} events for a batch of {}",
                generated.len(),
                request.len()
            )));
        }

        let discriminator = if gate_open {
            let real = DiscriminatorBatch::real(batch.images.clone(), batch.energy.clone())?;
            let targets = real_targets(self.mode, batch)?;
            let mut real_loss = models.discriminator.step(&real, &targets, &self.weights)?;
            ctx.coordinator.average_losses(&mut real_loss)?;

            let targets = fake_targets(self.mode, &request, self.label_flip_prob, &mut ctx.rng)?;
            let fake = DiscriminatorBatch::generated(generated, request.energy)?;
            let mut fake_loss = models.discriminator.step(&fake, &targets, &self.weights)?;
            ctx.coordinator.average_losses(&mut fake_loss)?;

            LossVector::mean(&[real_loss, fake_loss])?
        } else {
            None
        };

        let mut generator_losses = Vec::with_capacity(self.generator_updates);
        for _ in 0..self.generator_updates {
            let request = self.sample_request(ctx);
            let targets = trick_targets(self.mode, &request)?;
            let mut loss = models.combined.step(&request, &targets, &self.weights)?;
            ctx.coordinator.average_losses(&mut loss)?;
            generator_losses.push(loss);
        }
        let generator = LossVector::mean(&generator_losses)?
            .ok_or_else(|| TrainingError::InvalidSpec("no generator updates per step".to_string()))?;

        Ok(StepLosses { discriminator, generator })
    }

    /// One sequential sweep over the dataset.
    pub fn run_epoch<G, D, C>(
        &self,
        models: &mut GanModels<G, D, C>,
        dataset: &ShowerDataset,
        epoch: u32,
        last_gen_loss: Option<f32>,
        ctx: &mut TrainingContext,
    ) -> TrainingResult<EpochReport>
    where
        G: Inference<Input = GeneratorInput, Output = ShowerImages>,
        D: Trainable<Input = DiscriminatorBatch>,
        C: Trainable<Input = GeneratorInput>,
    {
        let nb_batches = dataset.nb_batches(self.batch_size);
        if nb_batches == 0 {
            return Err(TrainingError::Dataset(format!(
                "{} events cannot fill a batch of {}",
                dataset.len(),
                self.batch_size
            )));
        }

        let gate_open = self.gate.is_open(epoch, last_gen_loss);
        if !gate_open {
            info!(
                epoch,
                last_gen_loss = ?last_gen_loss,
                ceiling = self.gate.ceiling,
                "generator loss above ceiling, discriminator frozen this epoch"
            );
        }

        let mut generator_history = Vec::with_capacity(nb_batches);
        let mut discriminator_history = Vec::with_capacity(nb_batches);
        for index in 0..nb_batches {
            ctx.emit(ProgressEvent::Step { job_id: ctx.job_id.clone(), epoch, step: index, total: nb_batches });

            let batch = dataset.batch(index, self.batch_size)?;
            let losses = self.train_step(models, &batch, gate_open, ctx)?;
            if let Some(d) = losses.discriminator {
                discriminator_history.push(d);
            }
            generator_history.push(losses.generator);
        }

        let generator = LossVector::mean(&generator_history)?
            .ok_or_else(|| TrainingError::Dataset("epoch ran no steps".to_string()))?;
        let discriminator = LossVector::mean(&discriminator_history)?;
        debug!(epoch, steps = nb_batches, discriminator_updates = discriminator_history.len(), "epoch complete");

        Ok(EpochReport {
            epoch,
            steps: nb_batches,
            discriminator_updates: discriminator_history.len(),
            generator,
            discriminator,
        })
    }

    /// A single ungated step on the first batch whose losses are discarded;
    /// allocates optimizer slots before saved optimizer state is installed.
    pub fn warmup<G, D, C>(
        &self,
        models: &mut GanModels<G, D, C>,
        dataset: &ShowerDataset,
        ctx: &mut TrainingContext,
    ) -> TrainingResult<()>
    where
        G: Inference<Input = GeneratorInput, Output = ShowerImages>,
        D: Trainable<Input = DiscriminatorBatch>,
        C: Trainable<Input = GeneratorInput>,
    {
        let batch = dataset.batch(0, self.batch_size)?;
        let losses = self.train_step(models, &batch, true, ctx)?;
        debug!(generator = %losses.generator, "warm-up step done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_open_without_history() {
        let gate = DiscriminatorGate::new(5.0, 10);
        assert!(gate.is_open(0, None));
        assert!(gate.is_open(50, None));
    }

    #[test]
    fn test_gate_closes_above_ceiling_after_warmup() {
        let gate = DiscriminatorGate::new(5.0, 10);
        assert!(gate.is_open(9, Some(100.0)));
        assert!(!gate.is_open(10, Some(100.0)));
        assert!(!gate.is_open(10, Some(5.0)));
        assert!(gate.is_open(10, Some(4.99)));
    }

    #[test]
    fn test_gate_nan_loss_closes_after_warmup() {
        let gate = DiscriminatorGate::new(5.0, 10);
        assert!(!gate.is_open(12, Some(f32::NAN)));
        assert!(gate.is_open(3, Some(f32::NAN)));
    }

    #[test]
    fn test_generator_updates_doubled() {
        let hp = TrainingHyperParams { train_gen_per_epoch: 3, ..Default::default() };
        let scheduler = AdversarialScheduler::new(GanMode::Plain, &hp);
        assert_eq!(scheduler.generator_updates(), 6);
    }
}
