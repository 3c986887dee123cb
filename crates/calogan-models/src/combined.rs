//! Generator stacked on the discriminator, with only the generator trainable.

use crate::convert::column;
use crate::discriminator::{DiscriminatorNet, weighted_loss};
use crate::error::CandleResultExt;
use crate::generator::GeneratorNet;
use crate::optimizer::{Adam, ParamSet};
use calogan_training::{
    GeneratorInput, LossVector, LossWeights, ModelState, StateKind, TargetSet, Trainable, TrainingError,
    TrainingResult, WeightSet,
};
use candle_core::Device;
use tracing::debug;

/// Shares parameters with the standalone generator and discriminator. Its optimizer
/// only holds the generator's parameters, so discriminator weights stay frozen here.
#[derive(Debug)]
pub struct CaloCombined {
    generator: GeneratorNet,
    discriminator: DiscriminatorNet,
    params: ParamSet,
    optimizer: Adam,
    device: Device,
}

impl CaloCombined {
    /// `params` lists generator parameters first, then discriminator parameters.
    pub fn new(
        generator: GeneratorNet,
        discriminator: DiscriminatorNet,
        params: ParamSet,
        optimizer: Adam,
        device: Device,
    ) -> Self {
        Self { generator, discriminator, params, optimizer, device }
    }
}

impl ModelState for CaloCombined {
    fn snapshot_state(&self, kind: StateKind) -> TrainingResult<WeightSet> {
        match kind {
            StateKind::Weights => self.params.snapshot(),
            StateKind::Optimizer => self.optimizer.snapshot(),
        }
    }

    fn restore_state(&mut self, kind: StateKind, state: &WeightSet) -> TrainingResult<()> {
        match kind {
            StateKind::Weights => self.params.restore(state),
            StateKind::Optimizer => self.optimizer.restore(state),
        }
    }
}

impl Trainable for CaloCombined {
    type Input = GeneratorInput;

    fn step(&mut self, input: &GeneratorInput, targets: &TargetSet, weights: &LossWeights) -> TrainingResult<LossVector> {
        if targets.len() != input.len() {
            return Err(TrainingError::Shape(format!(
                "{} targets for a request of {}",
                targets.len(),
                input.len()
            )));
        }
        let images = self.generator.generate(input, &self.device)?;
        let energy = column(&input.energy, &self.device)?;
        let heads = self.discriminator.forward(&images, &energy).or_model_err()?;
        let (loss, values) = weighted_loss(&heads, targets, weights, &self.device)?;
        let grads = loss.backward().or_model_err()?;
        self.optimizer.step(&grads)?;
        debug!(loss = values.total(), "generator step");
        Ok(values)
    }
}
