//! CaloGAN Models
//!
//! Reference generator, discriminator and combined model on `candle`:
//! - Per-layer dense image heads conditioned on energy and class
//! - Inpainting attention between consecutive calorimeter layers
//! - Energy-conservation and minibatch-discrimination features
//! - Keras-style Adam with optional cross-worker gradient averaging

pub mod combined;
pub mod config;
mod convert;
pub mod discriminator;
mod error;
pub mod generator;
pub mod ops;
pub mod optimizer;

pub use combined::CaloCombined;
pub use config::{LastActivation, ModelConfig};
pub use discriminator::{CaloDiscriminator, DiscriminatorHeads, DiscriminatorNet};
pub use generator::{CaloGenerator, GeneratorNet};
pub use optimizer::{Adam, AdamSettings, ParamSet};

use calogan_training::{
    Communicator, GanMode, GanModels, LayerShape, NUM_LAYERS, TrainingHyperParams, TrainingResult,
};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use std::sync::Arc;
use tracing::info;

pub type CaloModels = GanModels<CaloGenerator, CaloDiscriminator, CaloCombined>;

/// Build the three models for `mode` on the CPU.
///
/// The combined model shares parameter storage with the generator and discriminator.
/// `comm`, when it spans more than one worker, averages gradients on every update.
pub fn build_models(
    mode: GanMode,
    shapes: [LayerShape; NUM_LAYERS],
    hp: &TrainingHyperParams,
    config: &ModelConfig,
    comm: Option<Arc<dyn Communicator>>,
) -> TrainingResult<CaloModels> {
    config.validate()?;
    let device = Device::Cpu;
    let adam = |lr: f64| AdamSettings { lr, beta1: hp.adam_beta1, beta2: config.adam_beta2, epsilon: config.adam_epsilon };

    let generator_vars = VarMap::new();
    let generator_net = GeneratorNet::new(
        mode,
        hp.latent_size,
        shapes,
        config,
        VarBuilder::from_varmap(&generator_vars, DType::F32, &device),
    )?;
    let generator_params = ParamSet::from_varmap(&generator_vars)?;

    let discriminator_vars = VarMap::new();
    let discriminator_net =
        DiscriminatorNet::new(mode, shapes, config, VarBuilder::from_varmap(&discriminator_vars, DType::F32, &device))?;
    let discriminator_params = ParamSet::from_varmap(&discriminator_vars)?;

    info!(
        ?mode,
        generator_params = generator_params.len(),
        discriminator_params = discriminator_params.len(),
        attention = config.attention,
        last_activation = %config.last_activation,
        "built models"
    );

    let generator = CaloGenerator::new(
        generator_net.clone(),
        generator_params.clone(),
        Adam::new(generator_params.clone(), adam(hp.gen_lr), None)?,
        device.clone(),
    );
    let discriminator = CaloDiscriminator::new(
        discriminator_net.clone(),
        discriminator_params.clone(),
        Adam::new(discriminator_params.clone(), adam(hp.disc_lr), comm.clone())?,
        device.clone(),
    );
    let combined = CaloCombined::new(
        generator_net,
        discriminator_net,
        generator_params.chain(&discriminator_params),
        Adam::new(generator_params, adam(hp.gen_lr), comm)?,
        device,
    );

    Ok(GanModels::new(mode, generator, discriminator, combined))
}
