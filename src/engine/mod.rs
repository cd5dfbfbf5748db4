//! Inference engines.
//!
//! The local language model sits behind [`InferenceEngine`] so the lifecycle
//! manager never depends on a concrete runtime. Whisper is used for
//! transcription and wake phrase recognition.

pub mod download;
pub mod onnx;
pub mod tier;
pub mod whisper;

pub use download::{download_artifact, Artifact, DownloadError};
pub use onnx::OnnxEngine;
pub use tier::{ModelSpec, ModelTier};
pub use whisper::{WhisperEngine, WhisperError, WhisperModel};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Model artifact not found at {0}")]
    ArtifactMissing(PathBuf),

    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Loads a language model for a tier.
pub trait InferenceEngine: Send + Sync {
    /// Backend name for logs and status.
    fn name(&self) -> &'static str;

    /// Load the model described by `spec`. Blocking; may take seconds.
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn LanguageModel>, EngineError>;
}

/// A loaded language model.
///
/// Implementations are not assumed re-entrant; callers serialize access.
pub trait LanguageModel: Send {
    /// Maximum sequence length in tokens.
    fn context_length(&self) -> usize;

    /// Number of tokens `text` encodes to (without special tokens).
    fn count_tokens(&self, text: &str) -> Result<usize, EngineError>;

    /// Generate a continuation of `prompt`, at most `max_tokens` long.
    fn generate(&mut self, prompt: &str, max_tokens: usize) -> Result<String, EngineError>;
}
