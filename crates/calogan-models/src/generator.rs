//! Conditional generator: noise, requested energy and class to three layer images.

use crate::config::{LastActivation, ModelConfig};
use crate::convert::{class_ids, column, matrix, tensors_to_images};
use crate::error::CandleResultExt;
use crate::ops::{HIDDEN_LEAK, InpaintingAttention, LAST_LEAK, ResizePlan, leaky_relu, softplus};
use crate::optimizer::{Adam, ParamSet};
use calogan_training::{
    GanMode, GeneratorInput, Inference, LayerShape, ModelState, NUM_LAYERS, ShowerImages, StateKind, TrainingError,
    TrainingResult, WeightSet,
};
use candle_core::{Device, Module, Result, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder, embedding, linear};
use tracing::debug;

/// Requested energies are divided by this before conditioning the latent vector.
pub const ENERGY_SCALE: f64 = 100.0;

/// Dense image head for one calorimeter layer.
#[derive(Debug, Clone)]
struct ImageHead {
    hidden: Linear,
    out: Linear,
    shape: LayerShape,
    activation: LastActivation,
}

impl ImageHead {
    fn new(latent_size: usize, shape: LayerShape, config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            hidden: linear(latent_size, config.hidden_size, vb.pp("hidden"))?,
            out: linear(config.hidden_size, shape.0 * shape.1, vb.pp("out"))?,
            shape,
            activation: config.last_activation,
        })
    }

    fn forward(&self, h: &Tensor) -> Result<Tensor> {
        let b = h.dim(0)?;
        let x = leaky_relu(&self.hidden.forward(h)?, HIDDEN_LEAK)?;
        let x = self.out.forward(&x)?;
        let x = match self.activation {
            LastActivation::None => x,
            LastActivation::Softplus => softplus(&x)?,
            LastActivation::LeakyRelu => leaky_relu(&x, LAST_LEAK)?,
        };
        x.reshape((b, self.shape.0, self.shape.1))
    }
}

#[derive(Debug, Clone)]
struct AttentionPath {
    zero_to_one: ResizePlan,
    one_to_two: ResizePlan,
    layer1: InpaintingAttention,
    layer2: InpaintingAttention,
}

/// Generator graph. Clones share parameters.
#[derive(Debug, Clone)]
pub struct GeneratorNet {
    mode: GanMode,
    latent_size: usize,
    embedding: Option<Embedding>,
    heads: Vec<ImageHead>,
    attention: Option<AttentionPath>,
}

impl GeneratorNet {
    pub fn new(
        mode: GanMode,
        latent_size: usize,
        shapes: [LayerShape; NUM_LAYERS],
        config: &ModelConfig,
        vb: VarBuilder,
    ) -> TrainingResult<Self> {
        let embedding = match mode {
            GanMode::Plain => None,
            GanMode::AuxClassifier { num_classes } => {
                Some(embedding(num_classes, latent_size, vb.pp("class_embedding")).or_model_err()?)
            }
        };
        let heads = shapes
            .iter()
            .enumerate()
            .map(|(i, &shape)| ImageHead::new(latent_size, shape, config, vb.pp(format!("layer{i}"))))
            .collect::<Result<Vec<_>>>()
            .or_model_err()?;

        let attention = if config.attention {
            let plan = |from: LayerShape, to: LayerShape| {
                ResizePlan::new(from, to).ok_or_else(|| {
                    TrainingError::InvalidSpec(format!(
                        "attention cannot map layer shape {from:?} onto {to:?}; use integer ratios or disable attention"
                    ))
                })
            };
            Some(AttentionPath {
                zero_to_one: plan(shapes[0], shapes[1])?,
                one_to_two: plan(shapes[1], shapes[2])?,
                layer1: InpaintingAttention::new(shapes[1], vb.pp("attention1")).or_model_err()?,
                layer2: InpaintingAttention::new(shapes[2], vb.pp("attention2")).or_model_err()?,
            })
        } else {
            None
        };

        Ok(Self { mode, latent_size, embedding, heads, attention })
    }

    #[must_use]
    pub fn mode(&self) -> GanMode {
        self.mode
    }

    /// `noise` is `[batch, latent]`, `energy` `[batch, 1]` in GeV, `class` `[batch]` ids.
    pub fn forward(&self, noise: &Tensor, energy: &Tensor, class: Option<&Tensor>) -> Result<[Tensor; NUM_LAYERS]> {
        let mut h = noise.broadcast_mul(&energy.affine(1.0 / ENERGY_SCALE, 0.0)?)?;
        if let (Some(embedding), Some(class)) = (&self.embedding, class) {
            h = h.mul(&embedding.forward(class)?)?;
        }
        let mut images = [self.heads[0].forward(&h)?, self.heads[1].forward(&h)?, self.heads[2].forward(&h)?];
        if let Some(path) = &self.attention {
            images[1] = path.layer1.forward(&images[1], &path.zero_to_one.apply(&images[0])?)?;
            images[2] = path.layer2.forward(&images[2], &path.one_to_two.apply(&images[1])?)?;
        }
        let [a, b, c] = images;
        Ok([a.relu()?, b.relu()?, c.relu()?])
    }

    /// Lift a request onto `device`, checking it against the mode and latent size.
    pub(crate) fn lift(
        &self,
        input: &GeneratorInput,
        device: &Device,
    ) -> TrainingResult<(Tensor, Tensor, Option<Tensor>)> {
        if input.noise.dim() != (input.len(), self.latent_size) {
            return Err(TrainingError::Shape(format!(
                "generator expects noise [{}, {}], got {:?}",
                input.len(),
                self.latent_size,
                input.noise.dim()
            )));
        }
        let class = match (self.mode, &input.class) {
            (GanMode::Plain, _) => None,
            (GanMode::AuxClassifier { num_classes }, Some(class)) => {
                if let Some(bad) = class.iter().find(|&&c| c as usize >= num_classes) {
                    return Err(TrainingError::Shape(format!("class {bad} out of range for {num_classes} classes")));
                }
                Some(class_ids(class, device)?)
            }
            (GanMode::AuxClassifier { .. }, None) => {
                return Err(TrainingError::Shape("ACGAN generator needs a class per event".to_string()));
            }
        };
        Ok((matrix(&input.noise, device)?, column(&input.energy, device)?, class))
    }

    pub(crate) fn generate(&self, input: &GeneratorInput, device: &Device) -> TrainingResult<[Tensor; NUM_LAYERS]> {
        let (noise, energy, class) = self.lift(input, device)?;
        self.forward(&noise, &energy, class.as_ref()).or_model_err()
    }
}

/// Standalone generator. Only used for inference; its parameters are trained through the combined model.
#[derive(Debug)]
pub struct CaloGenerator {
    net: GeneratorNet,
    params: ParamSet,
    optimizer: Adam,
    device: Device,
}

impl CaloGenerator {
    pub fn new(net: GeneratorNet, params: ParamSet, optimizer: Adam, device: Device) -> Self {
        Self { net, params, optimizer, device }
    }

    #[must_use]
    pub fn net(&self) -> &GeneratorNet {
        &self.net
    }

    #[must_use]
    pub fn params(&self) -> &ParamSet {
        &self.params
    }
}

impl ModelState for CaloGenerator {
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

impl Inference for CaloGenerator {
    type Input = GeneratorInput;
    type Output = ShowerImages;

    fn infer(&mut self, input: &GeneratorInput) -> TrainingResult<ShowerImages> {
        debug!(batch = input.len(), "generating showers");
        tensors_to_images(&self.net.generate(input, &self.device)?)
    }
}
