//! Per-batch targets, loss weights and label noise.

use crate::dataset::{GanMode, RealBatch};
use crate::error::{TrainingError, TrainingResult};
use crate::job::EnergyRange;
use crate::model::GeneratorInput;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Weight of the realism output.
pub const REALISM_WEIGHT: f32 = 1.0;
/// Weight of the energy reconstruction output ($\lambda_E$).
pub const ENERGY_WEIGHT: f32 = 0.05;
/// Weight of the auxiliary class output.
pub const CLASS_WEIGHT: f32 = 0.2;

/// Fixed per-output loss weights, identical for real, fake and generator batches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub realism: f32,
    pub energy: f32,
    pub class: Option<f32>,
}

impl LossWeights {
    #[must_use]
    pub fn for_mode(mode: GanMode) -> Self {
        Self {
            realism: REALISM_WEIGHT,
            energy: ENERGY_WEIGHT,
            class: mode.is_aux_classifier().then_some(CLASS_WEIGHT),
        }
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        let mut out = vec![self.realism, self.energy];
        out.extend(self.class);
        out
    }
}

/// `[total, realism, energy, (class)]` as returned by one training step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossVector(pub Vec<f32>);

impl LossVector {
    /// The weighted total, which drives the discriminator gate.
    #[must_use]
    pub fn total(&self) -> f32 {
        self.0.first().copied().unwrap_or(f32::NAN)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Elementwise arithmetic mean; `None` for an empty slice.
    pub fn mean(vectors: &[Self]) -> TrainingResult<Option<Self>> {
        let Some(first) = vectors.first() else {
            return Ok(None);
        };
        let mut sum = vec![0.0f64; first.len()];
        for v in vectors {
            if v.len() != first.len() {
                return Err(TrainingError::Shape(format!(
                    "loss vectors of different length: {} vs {}",
                    first.len(),
                    v.len()
                )));
            }
            for (acc, x) in sum.iter_mut().zip(&v.0) {
                *acc += f64::from(*x);
            }
        }
        let n = vectors.len() as f64;
        Ok(Some(Self(sum.into_iter().map(|s| (s / n) as f32).collect())))
    }
}

impl std::fmt::Display for LossVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, x) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{x:.6}")?;
        }
        write!(f, "]")
    }
}

/// Supervised targets for the discriminator heads.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSet {
    Plain {
        realism: Array1<f32>,
        energy: Array1<f32>,
    },
    AuxClassifier {
        realism: Array1<f32>,
        energy: Array1<f32>,
        class: Array1<u32>,
    },
}

impl TargetSet {
    #[must_use]
    pub fn realism(&self) -> &Array1<f32> {
        match self {
            Self::Plain { realism, .. } | Self::AuxClassifier { realism, .. } => realism,
        }
    }

    #[must_use]
    pub fn energy(&self) -> &Array1<f32> {
        match self {
            Self::Plain { energy, .. } | Self::AuxClassifier { energy, .. } => energy,
        }
    }

    #[must_use]
    pub fn class(&self) -> Option<&Array1<u32>> {
        match self {
            Self::Plain { .. } => None,
            Self::AuxClassifier { class, .. } => Some(class),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.realism().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.realism().is_empty()
    }

    fn build(mode: GanMode, realism: f32, energy: Array1<f32>, class: Option<Array1<u32>>) -> TrainingResult<Self> {
        let realism = Array1::from_elem(energy.len(), realism);
        match (mode, class) {
            (GanMode::Plain, _) => Ok(Self::Plain { realism, energy }),
            (GanMode::AuxClassifier { .. }, Some(class)) => Ok(Self::AuxClassifier { realism, energy, class }),
            (GanMode::AuxClassifier { .. }, None) => {
                Err(TrainingError::Shape("class targets are required in ACGAN mode".to_string()))
            }
        }
    }
}

/// Real batch: realism 1, true energy, true class.
pub fn real_targets(mode: GanMode, batch: &RealBatch) -> TrainingResult<TargetSet> {
    TargetSet::build(mode, 1.0, batch.energy.clone(), Some(batch.labels.clone()))
}

/// Fake batch: realism 0, the requested energy, the requested class with label flipping.
pub fn fake_targets<R: Rng + ?Sized>(
    mode: GanMode,
    request: &GeneratorInput,
    flip_prob: f64,
    rng: &mut R,
) -> TrainingResult<TargetSet> {
    let class = request.class.as_ref().map(|c| bit_flip(c, flip_prob, rng));
    TargetSet::build(mode, 0.0, request.energy.clone(), class)
}

/// Generator trick step: every event labelled real, the requested energy and class unflipped.
pub fn trick_targets(mode: GanMode, request: &GeneratorInput) -> TrainingResult<TargetSet> {
    TargetSet::build(mode, 1.0, request.energy.clone(), request.class.clone())
}

/// Replace each entry, independently with probability `prob`, by its logical negation
/// (`0 -> 1`, anything else `-> 0`).
pub fn bit_flip<R: Rng + ?Sized>(labels: &Array1<u32>, prob: f64, rng: &mut R) -> Array1<u32> {
    labels.mapv(|l| {
        if rng.gen_range(0.0..1.0) < prob {
            u32::from(l == 0)
        } else {
            l
        }
    })
}

/// Draw noise, requested energies and (for ACGAN) requested classes.
pub fn sample_generator_input<R: Rng + ?Sized>(
    mode: GanMode,
    batch_size: usize,
    latent_size: usize,
    energy_range: EnergyRange,
    rng: &mut R,
) -> GeneratorInput {
    let noise = Array2::from_shape_simple_fn((batch_size, latent_size), || rng.sample::<f32, _>(StandardNormal));
    let energy = Array1::from_shape_simple_fn(batch_size, || rng.gen_range(energy_range.min..energy_range.max));
    let class = match mode {
        GanMode::Plain => None,
        GanMode::AuxClassifier { num_classes } => {
            Some(Array1::from_shape_simple_fn(batch_size, || rng.gen_range(0..num_classes as u32)))
        }
    };
    GeneratorInput { noise, energy, class }
}
