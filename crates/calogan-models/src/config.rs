use calogan_training::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Activation applied to each generator image head before the final ReLU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastActivation {
    #[default]
    None,
    Softplus,
    LeakyRelu,
}

impl LastActivation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Softplus => "softplus",
            Self::LeakyRelu => "leakyrelu",
        }
    }
}

impl std::fmt::Display for LastActivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LastActivation {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "linear" => Ok(Self::None),
            "softplus" => Ok(Self::Softplus),
            "leakyrelu" | "leaky_relu" => Ok(Self::LeakyRelu),
            other => Err(TrainingError::InvalidSpec(format!(
                "unknown last activation '{other}' (expected none, softplus or leakyrelu)"
            ))),
        }
    }
}

/// Architecture and optimizer settings of the reference models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Inpainting attention from layer 0 into 1 and from 1 into 2.
    pub attention: bool,
    pub last_activation: LastActivation,
    pub hidden_size: usize,
    /// Width of the per-layer discriminator feature vector.
    pub feature_size: usize,
    pub mbd_features: usize,
    pub mbd_vspace: usize,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            attention: true,
            last_activation: LastActivation::None,
            hidden_size: 256,
            feature_size: 32,
            mbd_features: 10,
            mbd_vspace: 10,
            adam_beta2: 0.999,
            adam_epsilon: 1e-7,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        for (name, value) in [
            ("hidden_size", self.hidden_size),
            ("feature_size", self.feature_size),
            ("mbd_features", self.mbd_features),
            ("mbd_vspace", self.mbd_vspace),
        ] {
            if value == 0 {
                return Err(TrainingError::InvalidSpec(format!("{name} must be >= 1")));
            }
        }
        if !(0.0..1.0).contains(&self.adam_beta2) {
            return Err(TrainingError::InvalidSpec("adam_beta2 must be in [0, 1)".to_string()));
        }
        if self.adam_epsilon <= 0.0 {
            return Err(TrainingError::InvalidSpec("adam_epsilon must be > 0".to_string()));
        }
        Ok(())
    }
}
