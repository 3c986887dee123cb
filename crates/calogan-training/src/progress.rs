use crate::job::TrainingJobId;
use crate::targets::LossVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { job_id: TrainingJobId, rank: usize, first_epoch: u32, last_epoch: u32 },
    EpochStarted { job_id: TrainingJobId, epoch: u32, nb_batches: usize },
    Step { job_id: TrainingJobId, epoch: u32, step: usize, total: usize },
    EpochFinished { job_id: TrainingJobId, epoch: u32, generator: LossVector, discriminator: Option<LossVector> },
    Finished { job_id: TrainingJobId },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Reports through `tracing`: every 100th batch at info, every 10th at debug.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { job_id, rank, first_epoch, last_epoch } => {
                info!(%job_id, rank, first_epoch, last_epoch, "training started");
            }
            ProgressEvent::EpochStarted { epoch, nb_batches, .. } => {
                info!(epoch, nb_batches, "Epoch {epoch} of training");
            }
            ProgressEvent::Step { epoch, step, total, .. } => {
                if step % 100 == 0 {
                    info!(epoch, step, total, "batch {step} / {total}");
                } else if step % 10 == 0 {
                    debug!(epoch, step, total, "batch {step} / {total}");
                }
            }
            ProgressEvent::EpochFinished { epoch, generator, discriminator, .. } => {
                info!("Epoch {epoch} Generator loss: {generator}");
                match discriminator {
                    Some(d) => info!("Epoch {epoch} Discriminator loss: {d}"),
                    None => info!("Epoch {epoch} Discriminator loss: none (gate closed)"),
                }
            }
            ProgressEvent::Finished { job_id } => info!(%job_id, "training finished"),
        }
    }
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}
