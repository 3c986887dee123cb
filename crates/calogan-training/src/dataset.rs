use crate::error::{TrainingError, TrainingResult};
use ndarray::{Array1, Array3, Axis, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Number of calorimeter layers every event carries.
pub const NUM_LAYERS: usize = 3;

/// Spatial size `(rows, cols)` of one calorimeter layer.
pub type LayerShape = (usize, usize);

/// Whether the auxiliary class head is present.
///
/// Selected once from the number of particle classes; every target, weight and
/// generator input is shaped by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GanMode {
    /// Single particle class: realism and energy outputs only.
    Plain,
    /// ACGAN: the discriminator also predicts the particle class.
    AuxClassifier { num_classes: usize },
}

impl GanMode {
    pub fn for_num_classes(num_classes: usize) -> TrainingResult<Self> {
        match num_classes {
            0 => Err(TrainingError::Dataset("dataset must contain at least one class".to_string())),
            1 => Ok(Self::Plain),
            n => Ok(Self::AuxClassifier { num_classes: n }),
        }
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        match self {
            Self::Plain => 1,
            Self::AuxClassifier { num_classes } => *num_classes,
        }
    }

    #[must_use]
    pub fn is_aux_classifier(&self) -> bool {
        matches!(self, Self::AuxClassifier { .. })
    }

    /// Length of the loss vector returned by a training step: the total plus one entry per output.
    #[must_use]
    pub fn loss_len(&self) -> usize {
        match self {
            Self::Plain => 3,
            Self::AuxClassifier { .. } => 4,
        }
    }
}

/// Three aligned per-layer image stacks, each `[batch, rows, cols]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShowerImages {
    pub layers: [Array3<f32>; NUM_LAYERS],
}

impl ShowerImages {
    pub fn new(layers: [Array3<f32>; NUM_LAYERS]) -> TrainingResult<Self> {
        let n = layers[0].len_of(Axis(0));
        if layers.iter().any(|l| l.len_of(Axis(0)) != n) {
            return Err(TrainingError::Shape(format!(
                "layer batch sizes differ: {:?}",
                layers.iter().map(|l| l.len_of(Axis(0))).collect::<Vec<_>>()
            )));
        }
        Ok(Self { layers })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers[0].len_of(Axis(0))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn shapes(&self) -> [LayerShape; NUM_LAYERS] {
        std::array::from_fn(|i| {
            let dim = self.layers[i].dim();
            (dim.1, dim.2)
        })
    }

    /// Energy deposited per event, summed over all layers.
    #[must_use]
    pub fn total_energy(&self) -> Array1<f32> {
        self.layers
            .iter()
            .map(|l| l.sum_axis(Axis(2)).sum_axis(Axis(1)))
            .fold(Array1::zeros(self.len()), |acc, e| acc + e)
    }
}

/// A contiguous slice of real events.
#[derive(Debug, Clone)]
pub struct RealBatch {
    pub images: ShowerImages,
    pub energy: Array1<f32>,
    pub labels: Array1<u32>,
}

/// All events of all classes, aligned along axis 0.
#[derive(Debug, Clone)]
pub struct ShowerDataset {
    images: ShowerImages,
    energy: Array1<f32>,
    labels: Array1<u32>,
    class_names: Vec<String>,
}

impl ShowerDataset {
    pub fn new(
        images: ShowerImages,
        energy: Array1<f32>,
        labels: Array1<u32>,
        class_names: Vec<String>,
    ) -> TrainingResult<Self> {
        let n = images.len();
        if energy.len() != n || labels.len() != n {
            return Err(TrainingError::Dataset(format!(
                "misaligned dataset: {n} events, {} energies, {} labels",
                energy.len(),
                labels.len()
            )));
        }
        if class_names.is_empty() {
            return Err(TrainingError::Dataset("dataset must contain at least one class".to_string()));
        }
        if let Some(bad) = labels.iter().find(|&&l| l as usize >= class_names.len()) {
            return Err(TrainingError::Dataset(format!(
                "label {bad} out of range for {} classes",
                class_names.len()
            )));
        }
        Ok(Self { images, energy, labels, class_names })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn mode(&self) -> TrainingResult<GanMode> {
        GanMode::for_num_classes(self.num_classes())
    }

    #[must_use]
    pub fn layer_shapes(&self) -> [LayerShape; NUM_LAYERS] {
        self.images.shapes()
    }

    #[must_use]
    pub fn energy(&self) -> &Array1<f32> {
        &self.energy
    }

    #[must_use]
    pub fn labels(&self) -> &Array1<u32> {
        &self.labels
    }

    /// Number of full batches in one sequential sweep; the remainder is dropped.
    #[must_use]
    pub fn nb_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 { 0 } else { self.len() / batch_size }
    }

    /// The `index`-th contiguous batch.
    pub fn batch(&self, index: usize, batch_size: usize) -> TrainingResult<RealBatch> {
        let start = index * batch_size;
        let end = start + batch_size;
        if batch_size == 0 || end > self.len() {
            return Err(TrainingError::Dataset(format!(
                "batch {index} of size {batch_size} is out of range for {} events",
                self.len()
            )));
        }
        let layers = std::array::from_fn(|i| self.images.layers[i].slice(s![start..end, .., ..]).to_owned());
        Ok(RealBatch {
            images: ShowerImages { layers },
            energy: self.energy.slice(s![start..end]).to_owned(),
            labels: self.labels.slice(s![start..end]).to_owned(),
        })
    }

    /// Apply one seeded permutation to every aligned array.
    #[must_use]
    pub fn shuffled(self, seed: u64) -> Self {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let layers = std::array::from_fn(|i| self.images.layers[i].select(Axis(0), &order));
        Self {
            images: ShowerImages { layers },
            energy: self.energy.select(Axis(0), &order),
            labels: self.labels.select(Axis(0), &order),
            class_names: self.class_names,
        }
    }
}
