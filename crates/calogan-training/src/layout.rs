use crate::error::TrainingResult;
use crate::job::CheckpointPolicy;
use crate::model::{ModelRole, StateKind};
use std::path::{Path, PathBuf};

/// Filesystem layout for checkpoint artifacts shared by all workers.
///
/// Artifacts are named `{prefix}{epoch:04}_{rank:03}.{weights|optimizer}` inside `root`,
/// so concurrent writers never collide.
#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    root: PathBuf,
    generator_prefix: String,
    discriminator_prefix: String,
    combined_prefix: String,
}

impl CheckpointLayout {
    #[must_use]
    pub fn new(root: PathBuf, generator_prefix: &str, discriminator_prefix: &str, combined_prefix: &str) -> Self {
        Self {
            root,
            generator_prefix: generator_prefix.to_string(),
            discriminator_prefix: discriminator_prefix.to_string(),
            combined_prefix: combined_prefix.to_string(),
        }
    }

    #[must_use]
    pub fn from_policy(policy: &CheckpointPolicy) -> Self {
        Self::new(
            policy.dir.clone(),
            &policy.generator_prefix,
            &policy.discriminator_prefix,
            &policy.combined_prefix,
        )
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn prefix(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Generator => &self.generator_prefix,
            ModelRole::Discriminator => &self.discriminator_prefix,
            ModelRole::Combined => &self.combined_prefix,
        }
    }

    #[must_use]
    pub fn file_name(&self, role: ModelRole, kind: StateKind, epoch: u32, rank: usize) -> String {
        format!("{}{epoch:04}_{rank:03}.{}", self.prefix(role), kind.extension())
    }

    #[must_use]
    pub fn artifact_path(&self, role: ModelRole, kind: StateKind, epoch: u32, rank: usize) -> PathBuf {
        self.root.join(self.file_name(role, kind, epoch, rank))
    }

    /// Glob matching every epoch of one role, kind and rank.
    #[must_use]
    pub fn discovery_pattern(&self, role: ModelRole, kind: StateKind, rank: usize) -> String {
        let pattern = format!("{}*_{rank:03}.{}", glob::Pattern::escape(self.prefix(role)), kind.extension());
        let root = glob::Pattern::escape(&self.root.to_string_lossy());
        Path::new(&root).join(pattern).to_string_lossy().into_owned()
    }

    #[must_use]
    pub fn manifest_path(&self, rank: usize) -> PathBuf {
        self.root.join(format!("training_manifest_{rank:03}.json"))
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
