//! Discriminator: realism, reconstructed energy and, for ACGAN, the particle class.

use crate::config::ModelConfig;
use crate::convert::{class_ids, column, images_to_tensors, scalar, tensor_to_matrix, tensor_to_vector};
use crate::error::CandleResultExt;
use crate::ops::{
    HIDDEN_LEAK, MinibatchDiscrimination, bce_with_logits, energy_features, leaky_relu, mean_absolute_error,
};
use crate::optimizer::{Adam, ParamSet};
use calogan_training::{
    DiscriminatorBatch, DiscriminatorOutput, GanMode, LayerShape, LossVector, LossWeights, ModelState, NUM_LAYERS,
    StateKind, TargetSet, Trainable, TrainingError, TrainingResult, WeightSet,
};
use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, linear};
use tracing::debug;

/// Dense features of one layer image plus its fraction of lit pixels.
#[derive(Debug, Clone)]
struct LayerFeatures {
    hidden: Linear,
    out: Linear,
}

impl LayerFeatures {
    fn new(shape: LayerShape, config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            hidden: linear(shape.0 * shape.1, config.hidden_size, vb.pp("hidden"))?,
            out: linear(config.hidden_size, config.feature_size, vb.pp("out"))?,
        })
    }

    fn forward(&self, image: &Tensor) -> Result<(Tensor, Tensor)> {
        let flat = image.flatten_from(1)?;
        let x = leaky_relu(&self.hidden.forward(&flat)?, HIDDEN_LEAK)?;
        let features = leaky_relu(&self.out.forward(&x)?, HIDDEN_LEAK)?;
        let sparsity = flat.gt(&flat.zeros_like()?)?.to_dtype(DType::F32)?.mean_keepdim(1)?;
        Ok((features, sparsity))
    }
}

/// Raw head outputs for a batch.
#[derive(Debug, Clone)]
pub struct DiscriminatorHeads {
    /// `[batch, 1]` logits of the event being real.
    pub realism_logits: Tensor,
    /// `[batch, 1]` total deposited energy.
    pub energy: Tensor,
    /// `[batch, 1]` for two classes, `[batch, classes]` otherwise.
    pub class_logits: Option<Tensor>,
}

/// Discriminator graph. Clones share parameters.
#[derive(Debug, Clone)]
pub struct DiscriminatorNet {
    mode: GanMode,
    layers: Vec<LayerFeatures>,
    mbd: MinibatchDiscrimination,
    realism: Linear,
    class: Option<Linear>,
}

impl DiscriminatorNet {
    pub fn new(
        mode: GanMode,
        shapes: [LayerShape; NUM_LAYERS],
        config: &ModelConfig,
        vb: VarBuilder,
    ) -> TrainingResult<Self> {
        let build = || -> Result<Self> {
            let layers = shapes
                .iter()
                .enumerate()
                .map(|(i, &shape)| LayerFeatures::new(shape, config, vb.pp(format!("layer{i}"))))
                .collect::<Result<Vec<_>>>()?;
            let mbd = MinibatchDiscrimination::new(NUM_LAYERS, config.mbd_features, config.mbd_vspace, vb.pp("mbd"))?;
            // per-layer features and sparsity, energies, total, well, too-big flag, minibatch features
            let width = NUM_LAYERS * (config.feature_size + 1) + NUM_LAYERS + 3 + config.mbd_features;
            let realism = linear(width, 1, vb.pp("realism"))?;
            let class = match mode {
                GanMode::Plain => None,
                GanMode::AuxClassifier { num_classes: 2 } => Some(linear(width, 1, vb.pp("class"))?),
                GanMode::AuxClassifier { num_classes } => Some(linear(width, num_classes, vb.pp("class"))?),
            };
            Ok(Self { mode, layers, mbd, realism, class })
        };
        build().or_model_err()
    }

    #[must_use]
    pub fn mode(&self) -> GanMode {
        self.mode
    }

    /// `layers` are `[batch, rows, cols]`, `input_energy` `[batch, 1]`.
    pub fn forward(&self, layers: &[Tensor; NUM_LAYERS], input_energy: &Tensor) -> Result<DiscriminatorHeads> {
        let mut parts = Vec::with_capacity(2 * NUM_LAYERS + 5);
        for (net, image) in self.layers.iter().zip(layers) {
            let (features, sparsity) = net.forward(image)?;
            parts.push(features);
            parts.push(sparsity);
        }
        let energy = energy_features(layers, input_energy)?;
        parts.push(energy.energies.affine(0.1, 0.0)?);
        parts.push(energy.total.affine(0.01, 0.0)?);
        parts.push(energy.well.clone());
        parts.push(energy.too_big.clone());
        parts.push(self.mbd.forward(&energy.energies)?);
        let features = Tensor::cat(&parts, 1)?;

        Ok(DiscriminatorHeads {
            realism_logits: self.realism.forward(&features)?,
            energy: energy.total,
            class_logits: self.class.as_ref().map(|head| head.forward(&features)).transpose()?,
        })
    }
}

/// Weighted `[total, realism, energy, (class)]` loss; returns the graph node to differentiate and its values.
pub(crate) fn weighted_loss(
    heads: &DiscriminatorHeads,
    targets: &TargetSet,
    weights: &LossWeights,
    device: &Device,
) -> TrainingResult<(Tensor, LossVector)> {
    let realism = bce_with_logits(&heads.realism_logits, &column(targets.realism(), device)?)
        .and_then(|l| l.affine(f64::from(weights.realism), 0.0))
        .or_model_err()?;
    let energy = mean_absolute_error(&heads.energy, &column(targets.energy(), device)?)
        .and_then(|l| l.affine(f64::from(weights.energy), 0.0))
        .or_model_err()?;
    let mut terms = vec![realism, energy];

    match (&heads.class_logits, targets.class(), weights.class) {
        (None, None, None) => {}
        (Some(logits), Some(class), Some(weight)) => {
            let loss = if logits.dim(1).or_model_err()? == 1 {
                let as_float = class.mapv(|c| c as f32);
                bce_with_logits(logits, &column(&as_float, device)?)
            } else {
                candle_nn::loss::cross_entropy(logits, &class_ids(class, device)?)
            };
            terms.push(loss.and_then(|l| l.affine(f64::from(weight), 0.0)).or_model_err()?);
        }
        _ => return Err(TrainingError::Shape("class targets and class head disagree".to_string())),
    }

    let mut total = terms[0].clone();
    for term in &terms[1..] {
        total = total.add(term).or_model_err()?;
    }
    let mut values = vec![scalar(&total)?];
    for term in &terms {
        values.push(scalar(term)?);
    }
    Ok((total, LossVector(values)))
}

#[derive(Debug)]
pub struct CaloDiscriminator {
    net: DiscriminatorNet,
    params: ParamSet,
    optimizer: Adam,
    device: Device,
}

impl CaloDiscriminator {
    pub fn new(net: DiscriminatorNet, params: ParamSet, optimizer: Adam, device: Device) -> Self {
        Self { net, params, optimizer, device }
    }

    #[must_use]
    pub fn net(&self) -> &DiscriminatorNet {
        &self.net
    }

    #[must_use]
    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    fn heads(&self, batch: &DiscriminatorBatch) -> TrainingResult<DiscriminatorHeads> {
        let layers = images_to_tensors(&batch.images, &self.device)?;
        let energy = column(&batch.energy, &self.device)?;
        self.net.forward(&layers, &energy).or_model_err()
    }

    /// Head outputs as probabilities, without updating anything.
    pub fn predict(&self, batch: &DiscriminatorBatch) -> TrainingResult<DiscriminatorOutput> {
        let heads = self.heads(batch)?;
        let realism = candle_nn::ops::sigmoid(&heads.realism_logits).or_model_err()?;
        let class = match &heads.class_logits {
            None => None,
            Some(logits) if logits.dim(1).or_model_err()? == 1 => {
                let p = candle_nn::ops::sigmoid(logits).or_model_err()?;
                let q = p.affine(-1.0, 1.0).or_model_err()?;
                Some(tensor_to_matrix(&Tensor::cat(&[q, p], 1).or_model_err()?)?)
            }
            Some(logits) => Some(tensor_to_matrix(&candle_nn::ops::softmax(logits, D::Minus1).or_model_err()?)?),
        };
        Ok(DiscriminatorOutput {
            realism: tensor_to_vector(&realism)?,
            energy: tensor_to_vector(&heads.energy)?,
            class,
        })
    }
}

impl ModelState for CaloDiscriminator {
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

impl Trainable for CaloDiscriminator {
    type Input = DiscriminatorBatch;

    fn step(&mut self, input: &DiscriminatorBatch, targets: &TargetSet, weights: &LossWeights) -> TrainingResult<LossVector> {
        if targets.len() != input.len() {
            return Err(TrainingError::Shape(format!(
                "{} targets for a batch of {}",
                targets.len(),
                input.len()
            )));
        }
        let heads = self.heads(input)?;
        let (loss, values) = weighted_loss(&heads, targets, weights, &self.device)?;
        let grads = loss.backward().or_model_err()?;
        self.optimizer.step(&grads)?;
        debug!(origin = ?input.origin(), loss = values.total(), "discriminator step");
        Ok(values)
    }
}
