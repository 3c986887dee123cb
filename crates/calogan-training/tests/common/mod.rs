//! Shared fixtures for calogan-training integration tests.
//!
//! The mock collaborators record every call into a shared log and move their
//! state in a predictable way: each discriminator update adds 1.0 to every
//! weight and to its optimizer step counter, the generator's weights never
//! change, and each combined update bumps only the combined optimizer counter.

#![allow(dead_code)]

use calogan_training::{
    BatchOrigin, CheckpointPolicy, DiscriminatorBatch, GanMode, GanModels, GeneratorInput, Inference, LossVector,
    LossWeights, ModelState, ShowerDataset, ShowerImages, StateKind, TargetSet, Trainable, TrainingError,
    TrainingJobSpec, TrainingResult, WeightSet,
};
use ndarray::{Array1, Array3, ArrayD, IxDyn};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const SHAPES: [(usize, usize); 3] = [(3, 4), (2, 2), (2, 1)];

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    GeneratorInfer { len: usize },
    DiscriminatorStep { origin: BatchOrigin, realism: Vec<f32>, class: Option<Vec<u32>>, max_pixel: f32 },
    CombinedStep { len: usize, realism: Vec<f32> },
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

pub fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog) -> Vec<Call> {
    log.lock().unwrap().clone()
}

pub fn filled(len: usize, value: f32) -> WeightSet {
    WeightSet(vec![ArrayD::from_elem(IxDyn(&[len]), value)])
}

fn restore(target: &mut WeightSet, state: &WeightSet) -> TrainingResult<()> {
    target.check_compatible(state)?;
    *target = state.clone();
    Ok(())
}

fn loss_for(mode: GanMode, total: f32) -> LossVector {
    let mut v = vec![total, total * 0.5, total * 0.25];
    if mode.is_aux_classifier() {
        v.push(total * 0.25);
    }
    LossVector(v)
}

pub struct MockGenerator {
    pub log: CallLog,
    pub weights: WeightSet,
    pub optimizer: WeightSet,
}

impl ModelState for MockGenerator {
    fn snapshot_state(&self, kind: StateKind) -> TrainingResult<WeightSet> {
        Ok(match kind {
            StateKind::Weights => self.weights.clone(),
            StateKind::Optimizer => self.optimizer.clone(),
        })
    }

    fn restore_state(&mut self, kind: StateKind, state: &WeightSet) -> TrainingResult<()> {
        match kind {
            StateKind::Weights => restore(&mut self.weights, state),
            StateKind::Optimizer => restore(&mut self.optimizer, state),
        }
    }
}

impl Inference for MockGenerator {
    type Input = GeneratorInput;
    type Output = ShowerImages;

    fn infer(&mut self, input: &GeneratorInput) -> TrainingResult<ShowerImages> {
        self.log.lock().unwrap().push(Call::GeneratorInfer { len: input.len() });
        let n = input.len();
        ShowerImages::new(SHAPES.map(|(h, w)| Array3::zeros((n, h, w))))
    }
}

pub struct MockDiscriminator {
    pub log: CallLog,
    pub mode: GanMode,
    pub weights: WeightSet,
    pub optimizer: WeightSet,
    pub loss: f32,
}

impl ModelState for MockDiscriminator {
    fn snapshot_state(&self, kind: StateKind) -> TrainingResult<WeightSet> {
        Ok(match kind {
            StateKind::Weights => self.weights.clone(),
            StateKind::Optimizer => self.optimizer.clone(),
        })
    }

    fn restore_state(&mut self, kind: StateKind, state: &WeightSet) -> TrainingResult<()> {
        match kind {
            StateKind::Weights => restore(&mut self.weights, state),
            StateKind::Optimizer => restore(&mut self.optimizer, state),
        }
    }
}

impl Trainable for MockDiscriminator {
    type Input = DiscriminatorBatch;

    fn step(&mut self, input: &DiscriminatorBatch, targets: &TargetSet, weights: &LossWeights) -> TrainingResult<LossVector> {
        if weights.class.is_some() != self.mode.is_aux_classifier() {
            return Err(TrainingError::Model("loss weights do not match mode".to_string()));
        }
        let max_pixel = input.images.layers.iter().flat_map(|l| l.iter().copied()).fold(0.0f32, f32::max);
        self.log.lock().unwrap().push(Call::DiscriminatorStep {
            origin: input.origin(),
            realism: targets.realism().to_vec(),
            class: targets.class().map(|c| c.to_vec()),
            max_pixel,
        });
        self.weights.0.iter_mut().for_each(|w| w.mapv_inplace(|x| x + 1.0));
        self.optimizer.0.iter_mut().for_each(|w| w.mapv_inplace(|x| x + 1.0));
        Ok(loss_for(self.mode, self.loss))
    }
}

pub struct MockCombined {
    pub log: CallLog,
    pub mode: GanMode,
    pub optimizer: WeightSet,
    pub loss: f32,
}

impl ModelState for MockCombined {
    fn snapshot_state(&self, kind: StateKind) -> TrainingResult<WeightSet> {
        Ok(match kind {
            StateKind::Weights => WeightSet::default(),
            StateKind::Optimizer => self.optimizer.clone(),
        })
    }

    fn restore_state(&mut self, kind: StateKind, state: &WeightSet) -> TrainingResult<()> {
        match kind {
            StateKind::Weights => Ok(()),
            StateKind::Optimizer => restore(&mut self.optimizer, state),
        }
    }
}

impl Trainable for MockCombined {
    type Input = GeneratorInput;

    fn step(&mut self, input: &GeneratorInput, targets: &TargetSet, _weights: &LossWeights) -> TrainingResult<LossVector> {
        self.log
            .lock()
            .unwrap()
            .push(Call::CombinedStep { len: input.len(), realism: targets.realism().to_vec() });
        self.optimizer.0.iter_mut().for_each(|w| w.mapv_inplace(|x| x + 1.0));
        Ok(loss_for(self.mode, self.loss))
    }
}

pub type MockModels = GanModels<MockGenerator, MockDiscriminator, MockCombined>;

/// Fresh mocks; `generator_loss` is what every combined update reports.
pub fn mock_models(mode: GanMode, log: &CallLog, generator_weight: f32, generator_loss: f32) -> MockModels {
    GanModels::new(
        mode,
        MockGenerator { log: Arc::clone(log), weights: filled(3, generator_weight), optimizer: filled(2, 0.0) },
        MockDiscriminator {
            log: Arc::clone(log),
            mode,
            weights: filled(4, 0.0),
            optimizer: filled(1, 0.0),
            loss: 0.7,
        },
        MockCombined { log: Arc::clone(log), mode, optimizer: filled(1, 0.0), loss: generator_loss },
    )
}

/// `per_class` events of each class, every pixel set to `1 + class`, energies `10 * (i + 1)`.
pub fn synthetic_dataset(classes: usize, per_class: usize) -> ShowerDataset {
    let n = classes * per_class;
    let labels = Array1::from_shape_fn(n, |i| (i / per_class) as u32);
    let layers = SHAPES.map(|(h, w)| Array3::from_shape_fn((n, h, w), |(i, _, _)| 1.0 + (i / per_class) as f32));
    let energy = Array1::from_shape_fn(n, |i| 10.0 * (i + 1) as f32);
    let names = (0..classes).map(|c| format!("particle{c}")).collect();
    ShowerDataset::new(ShowerImages::new(layers).unwrap(), energy, labels, names).unwrap()
}

pub fn job(checkpoints: &Path, batch_size: usize, epochs: u32) -> TrainingJobSpec {
    let mut job = TrainingJobSpec::new(checkpoints.join("particles.yaml"));
    job.hyperparams.batch_size = batch_size;
    job.hyperparams.latent_size = 8;
    job.hyperparams.epochs = epochs;
    job.checkpoints = CheckpointPolicy { dir: checkpoints.to_path_buf(), ..CheckpointPolicy::default() };
    job
}

pub fn count(log: &CallLog, pred: impl Fn(&Call) -> bool) -> usize {
    calls(log).iter().filter(|c| pred(c)).count()
}

pub fn is_infer(c: &Call) -> bool {
    matches!(c, Call::GeneratorInfer { .. })
}

pub fn is_disc(c: &Call) -> bool {
    matches!(c, Call::DiscriminatorStep { .. })
}

pub fn is_combined(c: &Call) -> bool {
    matches!(c, Call::CombinedStep { .. })
}
