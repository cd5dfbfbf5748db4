//! Model quality/size tiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Tokenizer shared by every tier.
pub const TOKENIZER_FILE: &str = "phi3-tokenizer.json";

const TOKENIZER_URL: &str =
    "https://huggingface.co/microsoft/Phi-3-mini-4K-instruct/resolve/main/tokenizer.json";

/// Available language model tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// High quality, needs 4GB+ RAM
    Full,
    /// Balanced quality and speed
    #[default]
    Balanced,
    /// Lightweight, for low-memory devices
    Light,
}

impl ModelTier {
    pub const ALL: [ModelTier; 3] = [ModelTier::Full, ModelTier::Balanced, ModelTier::Light];

    /// Canonical name used in config and file names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Balanced => "balanced",
            Self::Light => "light",
        }
    }

    /// Italian name used by the `@modello` directive.
    pub fn italian_name(&self) -> &'static str {
        match self {
            Self::Full => "completa",
            Self::Balanced => "bilanciata",
            Self::Light => "leggera",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Full => "Alta qualità, richiede 4GB+ RAM",
            Self::Balanced => "Qualità e velocità bilanciate",
            Self::Light => "Leggera, per dispositivi con poca RAM",
        }
    }

    /// ONNX model filename.
    pub fn filename(&self) -> String {
        format!("phi3-{}.onnx", self.name())
    }

    /// Hugging Face download URL for the ONNX model.
    pub fn download_url(&self) -> &'static str {
        match self {
            Self::Full => "https://huggingface.co/microsoft/Phi-3-mini-4K-instruct-onnx/resolve/main/cpu-and-gpu-fp16/model.onnx",
            Self::Balanced => "https://huggingface.co/microsoft/Phi-3-mini-4K-instruct-onnx/resolve/main/cpu-int4-rtn-block-128/model.onnx",
            Self::Light => "https://huggingface.co/microsoft/Phi-3-mini-4K-instruct-onnx/resolve/main/cpu-int4-rtn-block-32/model.onnx",
        }
    }

    /// Resolve the on-disk artifacts for this tier.
    pub fn spec(&self, models_dir: &Path) -> ModelSpec {
        ModelSpec {
            tier: *self,
            model_path: models_dir.join(self.filename()),
            tokenizer_path: models_dir.join(TOKENIZER_FILE),
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" | "completa" => Ok(Self::Full),
            "balanced" | "bilanciata" => Ok(Self::Balanced),
            "light" | "leggera" => Ok(Self::Light),
            _ => Err(format!("Unknown model tier: {}", s)),
        }
    }
}

/// Resolved model artifacts, read at load time only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub tier: ModelTier,
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
}

impl ModelSpec {
    /// First missing artifact, if any.
    pub fn missing_artifact(&self) -> Option<&Path> {
        [&self.model_path, &self.tokenizer_path]
            .into_iter()
            .find(|p| !p.exists())
            .map(PathBuf::as_path)
    }

    pub fn tokenizer_url() -> &'static str {
        TOKENIZER_URL
    }
}
