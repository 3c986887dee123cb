use crate::dataset::GanMode;
use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingJobId;
use crate::model::{ModelRole, StateKind};
use crate::targets::LossVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Weights,
    OptimizerState,
}

impl From<StateKind> for ArtifactKind {
    fn from(kind: StateKind) -> Self {
        match kind {
            StateKind::Weights => Self::Weights,
            StateKind::Optimizer => Self::OptimizerState,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub kind: ArtifactKind,
    pub role: ModelRole,
    pub epoch: u32,
    pub rank: usize,
    pub path: PathBuf,
    pub sha256: String,
}

/// Epoch-mean losses of one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochLosses {
    pub epoch: u32,
    pub generator: LossVector,
    /// `None` when the gate kept the discriminator frozen for the whole epoch.
    pub discriminator: Option<LossVector>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs: Vec<EpochLosses>,
    /// Epoch the run resumed from, if any.
    pub resumed_from: Option<u32>,
}

impl TrainingMetrics {
    #[must_use]
    pub fn last_generator_loss(&self) -> Option<f32> {
        self.epochs.last().map(|e| e.generator.total())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingManifest {
    pub job_id: TrainingJobId,
    pub created_at: DateTime<Utc>,
    pub rank: usize,
    pub world_size: usize,
    pub mode: GanMode,
    #[serde(default)]
    pub metrics: TrainingMetrics,
    pub artifacts: Vec<TrainingArtifact>,
}

impl TrainingManifest {
    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(
    role: ModelRole,
    kind: StateKind,
    epoch: u32,
    rank: usize,
    path: PathBuf,
) -> TrainingResult<TrainingArtifact> {
    if !path.exists() {
        return Err(TrainingError::Checkpoint(format!(
            "artifact path does not exist: {}",
            path.display()
        )));
    }

    let hash = sha256_file(&path)?;
    Ok(TrainingArtifact { kind: kind.into(), role, epoch, rank, path, sha256: hash })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_make_artifact_hashes_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("g_0000_000.weights");
        std::fs::write(&path, b"abc").unwrap();

        let artifact = make_artifact(ModelRole::Generator, StateKind::Weights, 0, 0, path).unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Weights);
        assert_eq!(artifact.sha256, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");

        let missing = make_artifact(ModelRole::Generator, StateKind::Optimizer, 0, 0, temp.path().join("nope"));
        assert!(missing.is_err());
    }

    #[test]
    fn test_manifest_write_read() {
        let temp = TempDir::new().unwrap();
        let manifest = TrainingManifest {
            job_id: TrainingJobId::new(),
            created_at: Utc::now(),
            rank: 1,
            world_size: 2,
            mode: GanMode::AuxClassifier { num_classes: 2 },
            metrics: TrainingMetrics {
                epochs: vec![EpochLosses {
                    epoch: 3,
                    generator: LossVector(vec![1.5, 1.0, 0.25, 0.25]),
                    discriminator: None,
                }],
                resumed_from: Some(2),
            },
            artifacts: Vec::new(),
        };
        let path = temp.path().join("training_manifest_001.json");
        manifest.write(&path).unwrap();

        let back = TrainingManifest::read(&path).unwrap();
        assert_eq!(back.job_id, manifest.job_id);
        assert_eq!(back.metrics.epochs, manifest.metrics.epochs);
        assert_eq!(back.metrics.last_generator_loss(), Some(1.5));
    }
}
