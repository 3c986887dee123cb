//! Multi-worker synchronization.
//!
//! A [`Communicator`] is the transport: rank identity, broadcast, mean
//! all-reduce and a barrier. [`DistributedCoordinator`] builds the training
//! protocol on top of it: initial state broadcast, metric averaging, the
//! single-writer checkpoint policy and the post-resume rendezvous.

use crate::error::{TrainingError, TrainingResult};
use crate::model::{ModelState, StateKind};
use crate::targets::LossVector;
use std::sync::{Arc, Barrier, Mutex};
use tracing::{debug, warn};

/// Collective operations across a fixed group of workers.
///
/// Every rank must issue the same sequence of collective calls.
pub trait Communicator: Send + Sync {
    /// Global rank in `0..size`.
    fn rank(&self) -> usize;

    /// Device index within the host.
    fn local_rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Replace `values` on every rank with the contents held by `root`.
    fn broadcast(&self, values: &mut Vec<f32>, root: usize) -> TrainingResult<()>;

    /// Replace `values` with the elementwise mean over all ranks.
    fn allreduce_mean(&self, values: &mut [f32]) -> TrainingResult<()>;

    /// Block until every rank has arrived.
    fn barrier(&self) -> TrainingResult<()>;
}

/// A group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn local_rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast(&self, _values: &mut Vec<f32>, root: usize) -> TrainingResult<()> {
        if root != 0 {
            return Err(TrainingError::Distributed(format!("broadcast root {root} out of range for 1 worker")));
        }
        Ok(())
    }

    fn allreduce_mean(&self, _values: &mut [f32]) -> TrainingResult<()> {
        Ok(())
    }

    fn barrier(&self) -> TrainingResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Exchange {
    inputs: Vec<Option<Vec<f32>>>,
    outcome: Result<Vec<f32>, String>,
}

#[derive(Debug)]
struct GroupShared {
    size: usize,
    barrier: Barrier,
    exchange: Mutex<Exchange>,
}

/// One rank of an in-process group; ranks run on separate threads.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<GroupShared>,
}

impl LocalGroup {
    /// Create all `size` members of a new group, ordered by rank.
    pub fn create(size: usize) -> TrainingResult<Vec<Self>> {
        if size == 0 {
            return Err(TrainingError::Distributed("a worker group needs at least one rank".to_string()));
        }
        let shared = Arc::new(GroupShared {
            size,
            barrier: Barrier::new(size),
            exchange: Mutex::new(Exchange { inputs: vec![None; size], outcome: Ok(Vec::new()) }),
        });
        Ok((0..size).map(|rank| Self { rank, shared: Arc::clone(&shared) }).collect())
    }

    // Deposit, let the barrier leader combine, then read back. The last wait
    // keeps the next collective from overwriting the outcome before every rank
    // has read it; no rank leaves between waits, so a failure cannot strand the others.
    fn collective<F>(&self, input: Vec<f32>, combine: F) -> TrainingResult<Vec<f32>>
    where
        F: FnOnce(&[Option<Vec<f32>>]) -> TrainingResult<Vec<f32>>,
    {
        let deposited = self.lock().map(|mut exchange| exchange.inputs[self.rank] = Some(input));

        if self.shared.barrier.wait().is_leader() {
            if let Ok(mut exchange) = self.lock() {
                exchange.outcome = combine(&exchange.inputs).map_err(|e| e.to_string());
                exchange.inputs.iter_mut().for_each(|slot| *slot = None);
            }
        }
        self.shared.barrier.wait();

        let outcome = self.lock().map(|exchange| exchange.outcome.clone());
        self.shared.barrier.wait();

        deposited?;
        outcome?.map_err(TrainingError::Distributed)
    }

    fn lock(&self) -> TrainingResult<std::sync::MutexGuard<'_, Exchange>> {
        self.shared
            .exchange
            .lock()
            .map_err(|_| TrainingError::Distributed("worker group state poisoned".to_string()))
    }
}

impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn local_rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn broadcast(&self, values: &mut Vec<f32>, root: usize) -> TrainingResult<()> {
        if root >= self.shared.size {
            return Err(TrainingError::Distributed(format!(
                "broadcast root {root} out of range for {} workers",
                self.shared.size
            )));
        }
        let result = self.collective(std::mem::take(values), |inputs| {
            inputs[root]
                .clone()
                .ok_or_else(|| TrainingError::Distributed(format!("rank {root} contributed nothing to broadcast")))
        })?;
        *values = result;
        Ok(())
    }

    fn allreduce_mean(&self, values: &mut [f32]) -> TrainingResult<()> {
        let len = values.len();
        let result = self.collective(values.to_vec(), |inputs| {
            let mut sum = vec![0.0f64; len];
            for (rank, input) in inputs.iter().enumerate() {
                let input = input
                    .as_ref()
                    .ok_or_else(|| TrainingError::Distributed(format!("rank {rank} contributed nothing")))?;
                if input.len() != len {
                    return Err(TrainingError::Distributed(format!(
                        "all-reduce length mismatch: rank {rank} sent {} values, expected {len}",
                        input.len()
                    )));
                }
                for (acc, x) in sum.iter_mut().zip(input) {
                    *acc += f64::from(*x);
                }
            }
            let n = inputs.len() as f64;
            Ok(sum.into_iter().map(|s| (s / n) as f32).collect())
        })?;
        values.copy_from_slice(&result);
        Ok(())
    }

    fn barrier(&self) -> TrainingResult<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}

/// Training-level synchronization policy over a [`Communicator`].
#[derive(Clone)]
pub struct DistributedCoordinator {
    comm: Arc<dyn Communicator>,
    single_writer: bool,
}

impl std::fmt::Debug for DistributedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCoordinator")
            .field("rank", &self.comm.rank())
            .field("size", &self.comm.size())
            .field("single_writer", &self.single_writer)
            .finish()
    }
}

impl DistributedCoordinator {
    /// Rank whose state is authoritative.
    pub const ROOT: usize = 0;

    pub fn new(comm: Arc<dyn Communicator>, single_writer: bool) -> Self {
        Self { comm, single_writer }
    }

    #[must_use]
    pub fn single_process() -> Self {
        Self::new(Arc::new(SingleProcess), false)
    }

    #[must_use]
    pub fn communicator(&self) -> Arc<dyn Communicator> {
        Arc::clone(&self.comm)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    #[must_use]
    pub fn local_rank(&self) -> usize {
        self.comm.local_rank()
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.comm.size()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.rank() == Self::ROOT
    }

    /// Whether this rank writes checkpoint artifacts.
    #[must_use]
    pub fn should_write(&self) -> bool {
        !self.single_writer || self.is_root()
    }

    /// Rank suffix of the artifacts this rank reads on resume.
    #[must_use]
    pub fn rank_to_load(&self) -> usize {
        if self.single_writer { Self::ROOT } else { self.rank() }
    }

    /// Overwrite the model's weights and optimizer slots with rank 0's.
    pub fn broadcast_model<M: ModelState + ?Sized>(&self, model: &mut M, name: &str) -> TrainingResult<()> {
        if self.world_size() == 1 {
            return Ok(());
        }
        for kind in [StateKind::Weights, StateKind::Optimizer] {
            let local = model.snapshot_state(kind)?;
            let mut values = local.flatten();
            self.comm.broadcast(&mut values, Self::ROOT)?;
            let synced = local.unflatten_like(&values).map_err(|e| {
                TrainingError::Distributed(format!("{name} {kind:?} state differs from rank 0: {e}"))
            })?;
            model.restore_state(kind, &synced)?;
        }
        debug!(model = name, rank = self.rank(), "state broadcast from rank 0");
        Ok(())
    }

    /// Replace a per-step loss vector with its cross-worker mean.
    pub fn average_losses(&self, losses: &mut LossVector) -> TrainingResult<()> {
        self.comm.allreduce_mean(&mut losses.0)
    }

    /// All ranks have finished reading shared artifacts.
    pub fn rendezvous(&self) -> TrainingResult<()> {
        self.comm.barrier()
    }

    /// Fail on every rank if any rank's local `outcome` is an error.
    ///
    /// Call after rank-local work that comes before the next collective; a
    /// rank that bails out alone would leave its peers blocked there. The
    /// failing rank keeps its own error, the others get
    /// [`TrainingError::PeerFailed`].
    pub fn agree_on_success<T>(&self, outcome: TrainingResult<T>, phase: &str) -> TrainingResult<T> {
        if self.world_size() == 1 {
            return outcome;
        }
        let mut failed = [if outcome.is_err() { 1.0 } else { 0.0 }];
        self.comm.allreduce_mean(&mut failed)?;
        match outcome {
            Ok(_) if failed[0] > 0.0 => {
                warn!(rank = self.rank(), phase, "aborting, another worker failed");
                Err(TrainingError::PeerFailed(phase.to_string()))
            }
            outcome => outcome,
        }
    }

    /// Check that every rank discovered the same resume epoch.
    ///
    /// Ranks that disagree would issue different collective sequences, so a
    /// mismatch fails on all ranks at once.
    pub fn agree_on_epoch(&self, local: Option<u32>) -> TrainingResult<Option<u32>> {
        if self.world_size() == 1 {
            return Ok(local);
        }
        let encode = |e: Option<u32>| e.map_or(-1.0, |e| e as f32);
        let mut root = vec![encode(local)];
        self.comm.broadcast(&mut root, Self::ROOT)?;

        let mut mismatch = [if root[0] == encode(local) { 0.0 } else { 1.0 }];
        self.comm.allreduce_mean(&mut mismatch)?;
        if mismatch[0] > 0.0 {
            return Err(TrainingError::Distributed(format!(
                "workers found different checkpoint epochs (rank {} found {local:?})",
                self.rank()
            )));
        }
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_process_is_identity() {
        let coord = DistributedCoordinator::single_process();
        let mut losses = LossVector(vec![1.0, 2.0]);
        coord.average_losses(&mut losses).unwrap();
        assert_eq!(losses, LossVector(vec![1.0, 2.0]));
        assert!(coord.should_write());
        assert_eq!(coord.rank_to_load(), 0);
    }

    #[test]
    fn test_local_group_allreduce_and_broadcast() {
        let group = LocalGroup::create(3).unwrap();
        let handles: Vec<_> = group
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let rank = member.rank() as f32;
                    let mut values = vec![rank, 10.0 * rank];
                    member.allreduce_mean(&mut values).unwrap();

                    let mut payload = if member.rank() == 0 { vec![7.0, 8.0, 9.0] } else { vec![0.0; 3] };
                    member.broadcast(&mut payload, 0).unwrap();

                    // a second round must not see stale results
                    let mut again = vec![rank];
                    member.allreduce_mean(&mut again).unwrap();
                    (values, payload, again)
                })
            })
            .collect();

        for handle in handles {
            let (values, payload, again) = handle.join().unwrap();
            assert_eq!(values, vec![1.0, 10.0]);
            assert_eq!(payload, vec![7.0, 8.0, 9.0]);
            assert_eq!(again, vec![1.0]);
        }
    }

    #[test]
    fn test_allreduce_length_mismatch_fails_everywhere() {
        let group = LocalGroup::create(2).unwrap();
        let handles: Vec<_> = group
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let mut values = vec![1.0; member.rank() + 1];
                    member.allreduce_mean(&mut values).is_err()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_agree_on_epoch() {
        let run = |epochs: Vec<Option<u32>>| -> Vec<bool> {
            let group = LocalGroup::create(epochs.len()).unwrap();
            let handles: Vec<_> = group
                .into_iter()
                .zip(epochs)
                .map(|(member, epoch)| {
                    thread::spawn(move || {
                        let coord = DistributedCoordinator::new(Arc::new(member), false);
                        coord.agree_on_epoch(epoch).is_ok()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        };

        assert_eq!(run(vec![Some(4), Some(4), Some(4)]), vec![true; 3]);
        assert_eq!(run(vec![None, None]), vec![true; 2]);
        assert_eq!(run(vec![Some(4), Some(5), Some(4)]), vec![false; 3]);
    }

    #[test]
    fn test_one_failing_rank_fails_all() {
        let group = LocalGroup::create(3).unwrap();
        let handles: Vec<_> = group
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let coord = DistributedCoordinator::new(Arc::new(member), false);
                    let local = if coord.rank() == 1 {
                        Err(TrainingError::Checkpoint("unreadable".to_string()))
                    } else {
                        Ok(coord.rank())
                    };
                    let outcome = coord.agree_on_success(local, "checkpoint load");
                    // the group is still usable afterwards
                    coord.rendezvous().unwrap();
                    outcome
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(matches!(outcomes[0], Err(TrainingError::PeerFailed(_))));
        assert!(matches!(outcomes[1], Err(TrainingError::Checkpoint(_))));
        assert!(matches!(outcomes[2], Err(TrainingError::PeerFailed(_))));
    }

    #[test]
    fn test_all_succeeding_ranks_keep_values() {
        let group = LocalGroup::create(2).unwrap();
        let handles: Vec<_> = group
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let coord = DistributedCoordinator::new(Arc::new(member), false);
                    coord.agree_on_success(Ok(coord.rank() * 10), "checkpoint load").unwrap()
                })
            })
            .collect();
        let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(values, vec![0, 10]);
    }

    #[test]
    fn test_single_writer_policy() {
        let group = LocalGroup::create(2).unwrap();
        let rank1 = DistributedCoordinator::new(Arc::new(group[1].clone()), true);
        assert!(!rank1.should_write());
        assert_eq!(rank1.rank_to_load(), 0);

        let rank1 = DistributedCoordinator::new(Arc::new(group[1].clone()), false);
        assert!(rank1.should_write());
        assert_eq!(rank1.rank_to_load(), 1);
    }
}
