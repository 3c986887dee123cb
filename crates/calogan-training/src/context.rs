use crate::distributed::DistributedCoordinator;
use crate::job::{TrainingJobId, TrainingJobSpec};
use crate::progress::{ProgressEvent, ProgressSink, TracingProgressSink};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use tracing::{Span, info_span};

/// Per-worker state handed down through a training run.
///
/// Holds everything that would otherwise be process-global: the random
/// generator, the worker's tracing span, the collective group and the
/// progress sink.
pub struct TrainingContext {
    pub job_id: TrainingJobId,
    pub rng: StdRng,
    pub span: Span,
    pub coordinator: DistributedCoordinator,
    pub progress: Arc<dyn ProgressSink>,
}

impl TrainingContext {
    /// Seeds the generator with `seed + rank` so workers draw different noise.
    pub fn new(job: &TrainingJobSpec, coordinator: DistributedCoordinator, progress: Arc<dyn ProgressSink>) -> Self {
        let rank = coordinator.rank();
        let span = info_span!(
            "worker",
            rank,
            local_rank = coordinator.local_rank(),
            world_size = coordinator.world_size()
        );
        Self {
            job_id: job.job_id.clone(),
            rng: StdRng::seed_from_u64(job.hyperparams.seed.wrapping_add(rank as u64)),
            span,
            coordinator,
            progress,
        }
    }

    /// Single worker reporting through `tracing`.
    #[must_use]
    pub fn local(job: &TrainingJobSpec) -> Self {
        Self::new(job, DistributedCoordinator::single_process(), Arc::new(TracingProgressSink))
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.coordinator.rank()
    }

    pub fn emit(&self, event: ProgressEvent) {
        self.progress.on_event(event);
    }
}

impl std::fmt::Debug for TrainingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingContext")
            .field("job_id", &self.job_id)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}
