//! Local launch of one or more training workers.

use crate::config::ResolvedConfig;
use crate::progress::ProgressBarSink;
use anyhow::{Context, Result};
use calogan_models::{ModelConfig, build_models};
use calogan_training::{
    Communicator, DatasetLoadOptions, DistributedCoordinator, GanMode, GanTrainer, LayerShape, LocalGroup,
    NUM_LAYERS, ProgressSink, ShowerDataset, SingleProcess, TracingProgressSink, TrainingContext, TrainingError,
    TrainingJobSpec, TrainingManifest, load_dataset,
};
use std::sync::Arc;
use tracing::info;

struct Worker {
    job: TrainingJobSpec,
    model: ModelConfig,
    dataset: ShowerDataset,
    mode: GanMode,
    shapes: [LayerShape; NUM_LAYERS],
    comm: Arc<dyn Communicator>,
    prog_bar: bool,
}

impl Worker {
    fn run(self) -> Result<TrainingManifest> {
        let rank = self.comm.rank();
        let progress: Arc<dyn ProgressSink> =
            if self.prog_bar && rank == 0 { Arc::new(ProgressBarSink::new()) } else { Arc::new(TracingProgressSink) };
        let coordinator = DistributedCoordinator::new(self.comm.clone(), self.job.checkpoints.single_writer);
        let mut ctx = TrainingContext::new(&self.job, coordinator, progress);

        let models = build_models(self.mode, self.shapes, &self.job.hyperparams, &self.model, Some(self.comm))
            .with_context(|| format!("Failed to build models on rank {rank}"))?;
        let mut trainer =
            GanTrainer::new(self.job, self.dataset, models).with_context(|| format!("Invalid job on rank {rank}"))?;
        trainer.run(&mut ctx).with_context(|| format!("Training failed on rank {rank}"))
    }
}

fn communicators(workers: usize) -> Result<Vec<Arc<dyn Communicator>>> {
    if workers <= 1 {
        return Ok(vec![Arc::new(SingleProcess)]);
    }
    let group = LocalGroup::create(workers).context("Failed to create worker group")?;
    Ok(group.into_iter().map(|member| Arc::new(member) as Arc<dyn Communicator>).collect())
}

/// Load the dataset once, then train on `workers` in-process ranks.
///
/// Manifests come back in rank order.
pub async fn launch(config: ResolvedConfig, workers: usize, prog_bar: bool) -> Result<Vec<TrainingManifest>> {
    let dataset = load_dataset(&config.job.dataset, &DatasetLoadOptions::default())
        .with_context(|| format!("Failed to load dataset from {}", config.job.dataset.display()))?;
    let mode = dataset.mode()?;
    let shapes = dataset.layer_shapes();
    info!(
        events = dataset.len(),
        classes = ?dataset.class_names(),
        ?shapes,
        ?mode,
        workers,
        "dataset loaded"
    );

    let handles: Vec<_> = communicators(workers)?
        .into_iter()
        .map(|comm| {
            let worker = Worker {
                job: config.job.clone(),
                model: config.model.clone(),
                dataset: dataset.clone(),
                mode,
                shapes,
                comm,
                prog_bar,
            };
            tokio::task::spawn_blocking(move || worker.run())
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.await.context("Training worker panicked")?);
    }
    collect_manifests(outcomes)
}

/// Manifests in rank order, or the error of the rank that failed first-hand.
///
/// Ranks that only stopped because a peer failed are reported last.
fn collect_manifests(outcomes: Vec<Result<TrainingManifest>>) -> Result<Vec<TrainingManifest>> {
    let mut manifests = Vec::with_capacity(outcomes.len());
    let mut peer_failure = None;
    for outcome in outcomes {
        match outcome {
            Ok(manifest) => manifests.push(manifest),
            Err(e) if is_peer_failure(&e) => {
                peer_failure.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    match peer_failure {
        Some(e) => Err(e),
        None => Ok(manifests),
    }
}

fn is_peer_failure(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<TrainingError>(), Some(TrainingError::PeerFailed(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::path::PathBuf;

    #[test]
    fn test_first_hand_failure_wins_over_peer_failures() {
        let peer = || {
            Err(anyhow::Error::new(TrainingError::PeerFailed("checkpoint load".to_string())).context("rank 0"))
        };
        let missing = anyhow::Error::new(TrainingError::MissingCheckpoint { path: PathBuf::from("g_0004_001.weights") })
            .context("Training failed on rank 1");

        let err = collect_manifests(vec![peer(), Err(missing), peer()]).unwrap_err();
        assert!(format!("{err:#}").contains("g_0004_001.weights"));

        let err = collect_manifests(vec![peer(), peer()]).unwrap_err();
        assert!(is_peer_failure(&err));
        assert!(collect_manifests(vec![Err(anyhow!("boom"))]).is_err());
    }
}
