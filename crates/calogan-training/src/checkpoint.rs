//! Checkpoint persistence, epoch discovery and cross-worker weight averaging.

use crate::artifacts::{TrainingArtifact, make_artifact};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::CheckpointLayout;
use crate::model::{ModelRole, StateKind, WeightSet};
use ndarray::Zip;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// On-disk form of one artifact; the header is checked on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointFile {
    role: ModelRole,
    kind: StateKind,
    epoch: u32,
    rank: usize,
    state: WeightSet,
}

/// Reads and writes artifacts under a [`CheckpointLayout`].
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    layout: CheckpointLayout,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(layout: CheckpointLayout) -> Self {
        Self { layout }
    }

    #[must_use]
    pub fn layout(&self) -> &CheckpointLayout {
        &self.layout
    }

    /// Write one artifact, replacing any earlier file of the same key.
    pub fn save(
        &self,
        role: ModelRole,
        kind: StateKind,
        epoch: u32,
        rank: usize,
        state: &WeightSet,
    ) -> TrainingResult<TrainingArtifact> {
        self.layout.ensure_dirs()?;
        let path = self.layout.artifact_path(role, kind, epoch, rank);
        let file = CheckpointFile { role, kind, epoch, rank, state: state.clone() };

        // Readers glob for the final name only, so they never see a partial file.
        let staging = path.with_extension(format!("{}.partial", kind.extension()));
        std::fs::write(&staging, serde_json::to_vec(&file)?)?;
        std::fs::rename(&staging, &path)?;

        debug!(role = %role, ?kind, epoch, rank, path = %path.display(), "checkpoint written");
        make_artifact(role, kind, epoch, rank, path)
    }

    /// Load one artifact; a missing file is fatal.
    pub fn load(&self, role: ModelRole, kind: StateKind, epoch: u32, rank: usize) -> TrainingResult<(WeightSet, PathBuf)> {
        let path = self.layout.artifact_path(role, kind, epoch, rank);
        if !path.is_file() {
            return Err(TrainingError::MissingCheckpoint { path });
        }
        let bytes = std::fs::read(&path)?;
        let file: CheckpointFile = serde_json::from_slice(&bytes)?;
        if file.role != role || file.kind != kind || file.epoch != epoch || file.rank != rank {
            return Err(TrainingError::Checkpoint(format!(
                "{} holds {} {:?} of epoch {} rank {}",
                path.display(),
                file.role,
                file.kind,
                file.epoch,
                file.rank
            )));
        }
        info!(role = %role, ?kind, epoch, rank, path = %path.display(), "checkpoint loaded");
        Ok((file.state, path))
    }

    /// Epoch of the newest artifact for `(role, kind, rank)`, or `None` when nothing matches.
    ///
    /// Newest means latest modification time; ties go to the larger epoch.
    pub fn latest_epoch(&self, role: ModelRole, kind: StateKind, rank: usize) -> TrainingResult<Option<u32>> {
        let pattern = self.layout.discovery_pattern(role, kind, rank);
        let prefix = self.layout.prefix(role);

        let mut newest: Option<(SystemTime, u32)> = None;
        for entry in glob::glob(&pattern)? {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable checkpoint candidate");
                    continue;
                }
            };
            let Some(epoch) = path.file_name().and_then(|n| n.to_str()).and_then(|n| parse_epoch(n, prefix)) else {
                continue;
            };
            let modified = std::fs::metadata(&path)?.modified()?;
            if newest.is_none_or(|best| (modified, epoch) > best) {
                newest = Some((modified, epoch));
            }
        }

        let epoch = newest.map(|(_, epoch)| epoch);
        match epoch {
            Some(e) => info!(role = %role, ?kind, rank, epoch = e, "latest checkpoint epoch"),
            None => info!(role = %role, ?kind, rank, pattern = %pattern, "no checkpoint found"),
        }
        Ok(epoch)
    }

    /// Delete consumed artifacts; files already gone are ignored.
    pub fn remove(&self, paths: &[PathBuf]) -> TrainingResult<()> {
        for path in paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "checkpoint deleted"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// The first run of digits in `file_name` after the role prefix.
#[must_use]
pub fn parse_epoch(file_name: &str, prefix: &str) -> Option<u32> {
    let prefix_name = Path::new(prefix).file_name().and_then(|n| n.to_str()).unwrap_or(prefix);
    let rest = file_name.strip_prefix(prefix_name).unwrap_or(file_name);
    let digits: String = rest
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Elementwise mean of several compatible weight sets.
pub fn mean_weights(sets: &[WeightSet]) -> TrainingResult<WeightSet> {
    let Some(first) = sets.first() else {
        return Err(TrainingError::Checkpoint("cannot average zero weight sets".to_string()));
    };
    let mut sums: Vec<ndarray::ArrayD<f64>> = first.0.iter().map(|a| a.mapv(f64::from)).collect();
    for set in &sets[1..] {
        first.check_compatible(set)?;
        for (sum, array) in sums.iter_mut().zip(&set.0) {
            Zip::from(sum).and(array).for_each(|s, &x| *s += f64::from(x));
        }
    }
    let n = sets.len() as f64;
    Ok(WeightSet(sums.into_iter().map(|s| s.mapv(|x| (x / n) as f32)).collect()))
}

/// `alpha * mean(all) + (1 - alpha) * own`; `alpha == 0` returns `own` untouched.
pub fn average_with_workers(own: &WeightSet, all: &[WeightSet], alpha: f32) -> TrainingResult<WeightSet> {
    if alpha == 0.0 {
        return Ok(own.clone());
    }
    let ensemble = mean_weights(all)?;
    ensemble.blend(own, alpha)
}
