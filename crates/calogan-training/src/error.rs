use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training job spec: {0}")]
    InvalidSpec(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    /// A checkpoint artifact requested for resume does not exist.
    #[error("checkpoint file not found: {}", path.display())]
    MissingCheckpoint { path: PathBuf },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("distributed error: {0}")]
    Distributed(String),

    /// This rank stopped because a peer failed the named phase.
    #[error("stopped after another worker failed during {0}")]
    PeerFailed(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Npz(#[from] ndarray_npy::ReadNpzError),

    #[error(transparent)]
    Glob(#[from] glob::PatternError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ndarray::ShapeError> for TrainingError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Shape(err.to_string())
    }
}
