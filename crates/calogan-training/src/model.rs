//! Capability interface between the training loop and a numerical backend.
//!
//! The loop never sees layers or tensors of a concrete framework: it hands
//! batches to these traits and moves parameter/optimizer state around as
//! [`WeightSet`]s.

use crate::dataset::{GanMode, ShowerImages};
use crate::error::{TrainingError, TrainingResult};
use crate::targets::{LossVector, LossWeights, TargetSet};
use ndarray::{Array1, Array2, ArrayD, Zip};
use serde::{Deserialize, Serialize};

/// Which of the three co-trained models an artifact or state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Generator,
    Discriminator,
    /// Generator stacked on a frozen discriminator.
    Combined,
}

impl ModelRole {
    pub const ALL: [Self; 3] = [Self::Generator, Self::Discriminator, Self::Combined];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Discriminator => "discriminator",
            Self::Combined => "combined",
        }
    }
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters or optimizer slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Weights,
    Optimizer,
}

impl StateKind {
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Weights => "weights",
            Self::Optimizer => "optimizer",
        }
    }
}

/// Ordered list of arrays, as returned by `get_weights`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightSet(pub Vec<ArrayD<f32>>);

impl WeightSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of scalars across all arrays.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.0.iter().map(ArrayD::len).sum()
    }

    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.0.iter().map(|a| a.shape().to_vec()).collect()
    }

    /// All scalars in array order, each array in logical (row-major) order.
    #[must_use]
    pub fn flatten(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.num_elements());
        for array in &self.0 {
            out.extend(array.iter().copied());
        }
        out
    }

    /// Inverse of [`flatten`](Self::flatten), reusing this set's shapes.
    pub fn unflatten_like(&self, values: &[f32]) -> TrainingResult<Self> {
        if values.len() != self.num_elements() {
            return Err(TrainingError::Shape(format!(
                "expected {} values for {} arrays, got {}",
                self.num_elements(),
                self.len(),
                values.len()
            )));
        }
        let mut offset = 0;
        let mut arrays = Vec::with_capacity(self.len());
        for array in &self.0 {
            let n = array.len();
            arrays.push(ArrayD::from_shape_vec(array.raw_dim(), values[offset..offset + n].to_vec())?);
            offset += n;
        }
        Ok(Self(arrays))
    }

    pub fn check_compatible(&self, other: &Self) -> TrainingResult<()> {
        if self.shapes() != other.shapes() {
            return Err(TrainingError::Shape(format!(
                "weight sets differ: {:?} vs {:?}",
                self.shapes(),
                other.shapes()
            )));
        }
        Ok(())
    }

    /// `alpha * self + (1 - alpha) * other`, elementwise.
    pub fn blend(&self, other: &Self, alpha: f32) -> TrainingResult<Self> {
        self.check_compatible(other)?;
        Ok(Self(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(a, b)| Zip::from(a).and(b).map_collect(|&x, &y| alpha * x + (1.0 - alpha) * y))
                .collect(),
        ))
    }
}

/// Conditioning and noise for one generator call.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorInput {
    /// `[batch, latent_size]` standard-normal noise.
    pub noise: Array2<f32>,
    /// Requested energy per event, GeV.
    pub energy: Array1<f32>,
    /// Requested class per event; present exactly when the mode is ACGAN.
    pub class: Option<Array1<u32>>,
}

impl GeneratorInput {
    #[must_use]
    pub fn len(&self) -> usize {
        self.energy.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.energy.is_empty()
    }
}

/// Where the images of a discriminator batch come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOrigin {
    Real,
    Generated,
}

/// Discriminator input; one origin per batch, never mixed.
#[derive(Debug, Clone)]
pub struct DiscriminatorBatch {
    origin: BatchOrigin,
    pub images: ShowerImages,
    /// Energy fed alongside the images: true energy for real events, requested energy for generated ones.
    pub energy: Array1<f32>,
}

impl DiscriminatorBatch {
    pub fn real(images: ShowerImages, energy: Array1<f32>) -> TrainingResult<Self> {
        Self::new(BatchOrigin::Real, images, energy)
    }

    pub fn generated(images: ShowerImages, energy: Array1<f32>) -> TrainingResult<Self> {
        Self::new(BatchOrigin::Generated, images, energy)
    }

    fn new(origin: BatchOrigin, images: ShowerImages, energy: Array1<f32>) -> TrainingResult<Self> {
        if images.len() != energy.len() {
            return Err(TrainingError::Shape(format!(
                "{} images but {} energies in discriminator batch",
                images.len(),
                energy.len()
            )));
        }
        Ok(Self { origin, images, energy })
    }

    #[must_use]
    pub fn origin(&self) -> BatchOrigin {
        self.origin
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.energy.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.energy.is_empty()
    }
}

/// Discriminator heads for a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscriminatorOutput {
    /// Probability each event is real.
    pub realism: Array1<f32>,
    /// Reconstructed total energy, GeV.
    pub energy: Array1<f32>,
    /// Per-event class probabilities `[batch, classes]`, ACGAN only.
    pub class: Option<Array2<f32>>,
}

/// Snapshot and restore of parameters and optimizer slots.
pub trait ModelState {
    fn snapshot_state(&self, kind: StateKind) -> TrainingResult<WeightSet>;

    fn restore_state(&mut self, kind: StateKind, state: &WeightSet) -> TrainingResult<()>;
}

/// Forward pass without a parameter update.
pub trait Inference: ModelState {
    type Input;
    type Output;

    fn infer(&mut self, input: &Self::Input) -> TrainingResult<Self::Output>;
}

/// One synchronous optimizer step against weighted multi-output targets.
pub trait Trainable: ModelState {
    type Input;

    /// Returns `[total, realism, energy, (class)]`, each already multiplied by its weight.
    fn step(&mut self, input: &Self::Input, targets: &TargetSet, weights: &LossWeights) -> TrainingResult<LossVector>;
}

/// The generator, the discriminator, and the generator stacked on the frozen discriminator.
pub struct GanModels<G, D, C> {
    pub mode: GanMode,
    pub generator: G,
    pub discriminator: D,
    pub combined: C,
}

impl<G, D, C> GanModels<G, D, C>
where
    G: Inference<Input = GeneratorInput, Output = ShowerImages>,
    D: Trainable<Input = DiscriminatorBatch>,
    C: Trainable<Input = GeneratorInput>,
{
    pub fn new(mode: GanMode, generator: G, discriminator: D, combined: C) -> Self {
        Self { mode, generator, discriminator, combined }
    }

    pub fn snapshot(&self, role: ModelRole, kind: StateKind) -> TrainingResult<WeightSet> {
        match role {
            ModelRole::Generator => self.generator.snapshot_state(kind),
            ModelRole::Discriminator => self.discriminator.snapshot_state(kind),
            ModelRole::Combined => self.combined.snapshot_state(kind),
        }
    }

    pub fn restore(&mut self, role: ModelRole, kind: StateKind, state: &WeightSet) -> TrainingResult<()> {
        match role {
            ModelRole::Generator => self.generator.restore_state(kind, state),
            ModelRole::Discriminator => self.discriminator.restore_state(kind, state),
            ModelRole::Combined => self.combined.restore_state(kind, state),
        }
    }
}
