use crate::artifacts::{EpochLosses, TrainingArtifact, TrainingManifest, TrainingMetrics};
use crate::checkpoint::{CheckpointStore, average_with_workers};
use crate::context::TrainingContext;
use crate::dataset::{ShowerDataset, ShowerImages};
use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingJobSpec;
use crate::layout::CheckpointLayout;
use crate::model::{DiscriminatorBatch, GanModels, GeneratorInput, Inference, ModelRole, StateKind, Trainable};
use crate::progress::ProgressEvent;
use crate::schedule::AdversarialScheduler;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainerStatus {
    Idle,
    Resuming,
    Running { epoch: u32 },
    Finished,
    Failed(String),
}

/// Drives one worker's models through resume, broadcast, training and persistence.
pub struct GanTrainer<G, D, C> {
    job: TrainingJobSpec,
    dataset: ShowerDataset,
    models: GanModels<G, D, C>,
    scheduler: AdversarialScheduler,
    store: CheckpointStore,
    status: TrainerStatus,
    metrics: TrainingMetrics,
    artifacts: Vec<TrainingArtifact>,
}

impl<G, D, C> GanTrainer<G, D, C>
where
    G: Inference<Input = GeneratorInput, Output = ShowerImages>,
    D: Trainable<Input = DiscriminatorBatch>,
    C: Trainable<Input = GeneratorInput>,
{
    pub fn new(job: TrainingJobSpec, dataset: ShowerDataset, models: GanModels<G, D, C>) -> TrainingResult<Self> {
        job.validate()?;
        let mode = dataset.mode()?;
        if models.mode != mode {
            return Err(TrainingError::InvalidSpec(format!(
                "models built for {:?} but the dataset has {} classes",
                models.mode,
                dataset.num_classes()
            )));
        }
        if dataset.nb_batches(job.hyperparams.batch_size) == 0 {
            return Err(TrainingError::Dataset(format!(
                "{} events cannot fill a batch of {}",
                dataset.len(),
                job.hyperparams.batch_size
            )));
        }

        let scheduler = AdversarialScheduler::new(mode, &job.hyperparams);
        let store = CheckpointStore::new(CheckpointLayout::from_policy(&job.checkpoints));
        Ok(Self {
            job,
            dataset,
            models,
            scheduler,
            store,
            status: TrainerStatus::Idle,
            metrics: TrainingMetrics::default(),
            artifacts: Vec::new(),
        })
    }

    #[must_use]
    pub fn status(&self) -> &TrainerStatus {
        &self.status
    }

    #[must_use]
    pub fn models(&self) -> &GanModels<G, D, C> {
        &self.models
    }

    #[must_use]
    pub fn into_models(self) -> GanModels<G, D, C> {
        self.models
    }

    #[must_use]
    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    /// Resume, synchronize, train every epoch and write artifacts.
    pub fn run(&mut self, ctx: &mut TrainingContext) -> TrainingResult<TrainingManifest> {
        let span = ctx.span.clone();
        let _entered = span.enter();
        match self.run_inner(ctx) {
            Ok(manifest) => {
                self.status = TrainerStatus::Finished;
                Ok(manifest)
            }
            Err(e) => {
                self.status = TrainerStatus::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn run_inner(&mut self, ctx: &mut TrainingContext) -> TrainingResult<TrainingManifest> {
        let resumed = if self.job.checkpoints.resume_requested() {
            self.status = TrainerStatus::Resuming;
            self.resume(ctx)?
        } else {
            None
        };
        self.metrics.resumed_from = resumed;

        self.broadcast(ctx)?;

        let first_epoch = resumed.map_or(0, |e| e + 1);
        let last_epoch = first_epoch + self.job.hyperparams.epochs - 1;
        ctx.emit(ProgressEvent::Started { job_id: ctx.job_id.clone(), rank: ctx.rank(), first_epoch, last_epoch });
        info!(first_epoch, last_epoch, "commencing training");

        let nb_batches = self.dataset.nb_batches(self.job.hyperparams.batch_size);
        let mut last_gen_loss = None;
        for epoch in first_epoch..=last_epoch {
            self.status = TrainerStatus::Running { epoch };
            ctx.emit(ProgressEvent::EpochStarted { job_id: ctx.job_id.clone(), epoch, nb_batches });

            let report = self.scheduler.run_epoch(&mut self.models, &self.dataset, epoch, last_gen_loss, ctx)?;
            last_gen_loss = Some(report.generator.total());
            ctx.emit(ProgressEvent::EpochFinished {
                job_id: ctx.job_id.clone(),
                epoch,
                generator: report.generator.clone(),
                discriminator: report.discriminator.clone(),
            });
            self.metrics.epochs.push(EpochLosses {
                epoch,
                generator: report.generator,
                discriminator: report.discriminator,
            });

            let policy = &self.job.checkpoints;
            if ctx.coordinator.should_write() && (policy.save_all_epochs || epoch == last_epoch) {
                self.persist(epoch, ctx.rank())?;
            }
        }

        let manifest = TrainingManifest {
            job_id: self.job.job_id.clone(),
            created_at: chrono::Utc::now(),
            rank: ctx.rank(),
            world_size: ctx.coordinator.world_size(),
            mode: self.models.mode,
            metrics: self.metrics.clone(),
            artifacts: self.artifacts.clone(),
        };
        if ctx.coordinator.should_write() {
            self.store.layout().ensure_dirs()?;
            manifest.write(&self.store.layout().manifest_path(ctx.rank()))?;
        }

        ctx.emit(ProgressEvent::Finished { job_id: ctx.job_id.clone() });
        Ok(manifest)
    }

    /// Restore state from the newest checkpoint; returns the epoch resumed from.
    fn resume(&mut self, ctx: &mut TrainingContext) -> TrainingResult<Option<u32>> {
        let policy = self.job.checkpoints.clone();
        let rank = ctx.coordinator.rank_to_load();

        let (role, kind) = if policy.load_model {
            (ModelRole::Combined, StateKind::Optimizer)
        } else {
            (ModelRole::Discriminator, StateKind::Weights)
        };
        let discovered = self.store.latest_epoch(role, kind, rank);
        let found = ctx.coordinator.agree_on_success(discovered, "checkpoint discovery")?;
        let Some(epoch) = ctx.coordinator.agree_on_epoch(found)? else {
            info!(rank, "no checkpoint to resume from, starting fresh");
            return Ok(None);
        };
        if policy.load_model {
            self.scheduler.warmup(&mut self.models, &self.dataset, ctx)?;
        }

        let loaded = self.load_checkpoint(epoch, rank, ctx.coordinator.world_size());
        let mut consumed = ctx.coordinator.agree_on_success(loaded, "checkpoint load")?;

        // Nobody deletes until every rank has read what it needs.
        ctx.coordinator.rendezvous()?;
        if policy.retain_after_load {
            info!("keeping consumed checkpoints");
        } else {
            consumed.sort();
            consumed.dedup();
            let own: Vec<PathBuf> =
                consumed.into_iter().filter(|(owner, _)| *owner == ctx.rank()).map(|(_, path)| path).collect();
            self.store.remove(&own)?;
            info!(deleted = own.len(), "consumed checkpoints deleted");
        }

        Ok(Some(epoch))
    }

    /// Rank-local part of a resume: read and install every artifact for
    /// `epoch`. Returns the consumed files with the rank that owns each.
    fn load_checkpoint(&mut self, epoch: u32, rank: usize, world_size: usize) -> TrainingResult<Vec<(usize, PathBuf)>> {
        let policy = &self.job.checkpoints;
        let mut consumed = Vec::new();

        if policy.load_model {
            for role in ModelRole::ALL {
                let (state, path) = self.store.load(role, StateKind::Optimizer, epoch, rank)?;
                self.models.restore(role, StateKind::Optimizer, &state)?;
                info!(role = %role, epoch, path = %path.display(), "optimizer state restored");
                consumed.push((rank, path));
            }
        }

        let alpha = policy.weights_averaging_coeff;
        for role in [ModelRole::Generator, ModelRole::Discriminator] {
            let (own, path) = self.store.load(role, StateKind::Weights, epoch, rank)?;
            info!(role = %role, epoch, path = %path.display(), "weights restored");
            consumed.push((rank, path));

            let installed = if alpha == 0.0 {
                own
            } else {
                let mut all = Vec::with_capacity(world_size);
                for other in 0..world_size {
                    let (weights, path) = self.store.load(role, StateKind::Weights, epoch, other)?;
                    all.push(weights);
                    consumed.push((other, path));
                }
                info!(role = %role, alpha, workers = all.len(), "averaging weights across workers");
                average_with_workers(&own, &all, alpha)?
            };
            self.models.restore(role, StateKind::Weights, &installed)?;
        }

        Ok(consumed)
    }

    fn broadcast(&mut self, ctx: &TrainingContext) -> TrainingResult<()> {
        let coordinator = &ctx.coordinator;
        coordinator.broadcast_model(&mut self.models.generator, ModelRole::Generator.as_str())?;
        coordinator.broadcast_model(&mut self.models.discriminator, ModelRole::Discriminator.as_str())?;
        coordinator.broadcast_model(&mut self.models.combined, ModelRole::Combined.as_str())?;
        Ok(())
    }

    fn persist(&mut self, epoch: u32, rank: usize) -> TrainingResult<()> {
        let mut kinds = vec![(ModelRole::Generator, StateKind::Weights), (ModelRole::Discriminator, StateKind::Weights)];
        if self.job.checkpoints.save_model {
            kinds.extend(ModelRole::ALL.map(|role| (role, StateKind::Optimizer)));
        }
        for (role, kind) in kinds {
            let state = self.models.snapshot(role, kind)?;
            if state.is_empty() {
                warn!(role = %role, ?kind, "saving empty state");
            }
            let artifact = self.store.save(role, kind, epoch, rank, &state)?;
            self.artifacts.retain(|a| a.path != artifact.path);
            self.artifacts.push(artifact);
        }
        info!(epoch, rank, "checkpoint saved");
        Ok(())
    }
}
