//! CaloGAN Training
//!
//! Backend-agnostic training of conditional calorimeter-shower GANs:
//! - Defining training jobs (`TrainingJobSpec`)
//! - Loading multi-class shower datasets
//! - Building targets, loss weights and label noise
//! - Running the gated adversarial schedule (`GanTrainer`)
//! - Synchronizing workers (`DistributedCoordinator`)
//! - Writing, discovering and resuming checkpoints

pub mod artifacts;
pub mod builders;
pub mod checkpoint;
pub mod context;
pub mod dataset;
pub mod distributed;
pub mod error;
pub mod job;
pub mod layout;
pub mod model;
pub mod progress;
pub mod schedule;
pub mod targets;
pub mod trainer;

pub use artifacts::{ArtifactKind, EpochLosses, TrainingArtifact, TrainingManifest, TrainingMetrics};
pub use builders::{DatasetLoadOptions, DatasetManifest, build_dataset, load_dataset, read_manifest};
pub use checkpoint::{CheckpointStore, average_with_workers, mean_weights, parse_epoch};
pub use context::TrainingContext;
pub use dataset::{GanMode, LayerShape, NUM_LAYERS, RealBatch, ShowerDataset, ShowerImages};
pub use distributed::{Communicator, DistributedCoordinator, LocalGroup, SingleProcess};
pub use error::{TrainingError, TrainingResult};
pub use job::{CheckpointPolicy, EnergyRange, TrainingConfigFile, TrainingHyperParams, TrainingJobId, TrainingJobSpec};
pub use layout::CheckpointLayout;
pub use model::{
    BatchOrigin, DiscriminatorBatch, DiscriminatorOutput, GanModels, GeneratorInput, Inference, ModelRole,
    ModelState, StateKind, Trainable, WeightSet,
};
pub use progress::{NullProgressSink, ProgressEvent, ProgressSink, TracingProgressSink};
pub use schedule::{AdversarialScheduler, DiscriminatorGate, EpochReport, StepLosses};
pub use targets::{LossVector, LossWeights, TargetSet, bit_flip, fake_targets, real_targets, trick_targets};
pub use trainer::{GanTrainer, TrainerStatus};
