//! Whisper speech recognition using whisper-rs.
//!
//! Shared by the `/transcribe` endpoint and the wake phrase recognizer.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Sample rate Whisper expects.
pub const WHISPER_SAMPLE_RATE: u32 = 16000;

/// Whisper refuses clips shorter than one second; shorter input is padded.
const MIN_SAMPLES: usize = WHISPER_SAMPLE_RATE as usize * 11 / 10;

#[derive(Error, Debug)]
pub enum WhisperError {
    #[error("Whisper model not found at {0}. Run 'arcadia model download {1}'")]
    ModelNotFound(PathBuf, String),

    #[error("Failed to load Whisper model: {0}")]
    LoadFailed(String),

    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("Invalid audio: {0}")]
    InvalidAudio(String),
}

/// Available Whisper models. Small models are enough for a wake phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhisperModel {
    Tiny,
    Base,
    Small,
}

impl WhisperModel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Base => "base",
            Self::Small => "small",
        }
    }

    /// Get the model filename
    pub fn filename(&self) -> String {
        format!("ggml-{}.bin", self.name())
    }

    /// Get Hugging Face download URL
    pub fn download_url(&self) -> String {
        format!(
            "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/{}",
            self.filename()
        )
    }
}

impl std::str::FromStr for WhisperModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(Self::Tiny),
            "base" => Ok(Self::Base),
            "small" => Ok(Self::Small),
            _ => Err(format!("Unknown Whisper model: {}", s)),
        }
    }
}

/// Whisper transcription engine
pub struct WhisperEngine {
    ctx: WhisperContext,
    language: String,
}

impl WhisperEngine {
    /// Load `model` from `models_dir`.
    pub fn load(model: WhisperModel, models_dir: &Path, language: &str) -> Result<Self, WhisperError> {
        let model_path = models_dir.join(model.filename());
        if !model_path.exists() {
            return Err(WhisperError::ModelNotFound(model_path, model.name().to_string()));
        }

        info!("Loading Whisper model from: {}", model_path.display());

        let path_str = model_path
            .to_str()
            .ok_or_else(|| WhisperError::LoadFailed("model path is not valid UTF-8".into()))?;

        let ctx = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
            .map_err(|e| WhisperError::LoadFailed(format!("{:?}", e)))?;

        info!("Whisper model loaded successfully");

        Ok(Self {
            ctx,
            language: language.to_string(),
        })
    }

    /// Transcribe 16kHz mono samples to text.
    pub fn transcribe(&self, samples: &[f32]) -> Result<String, WhisperError> {
        if samples.is_empty() {
            return Err(WhisperError::InvalidAudio("Empty audio buffer".into()));
        }

        let started = std::time::Instant::now();

        let mut padded;
        let input = if samples.len() < MIN_SAMPLES {
            padded = samples.to_vec();
            padded.resize(MIN_SAMPLES, 0.0);
            padded.as_slice()
        } else {
            samples
        };

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| WhisperError::TranscriptionFailed(format!("{:?}", e)))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        if self.language != "auto" {
            params.set_language(Some(&self.language));
        }
        params.set_no_context(true);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state
            .full(params, input)
            .map_err(|e| WhisperError::TranscriptionFailed(format!("{:?}", e)))?;

        let num_segments = state
            .full_n_segments()
            .map_err(|e| WhisperError::TranscriptionFailed(format!("{:?}", e)))?;

        let mut text = String::new();
        for i in 0..num_segments {
            if let Ok(segment) = state.full_get_segment_text(i) {
                text.push_str(&segment);
            }
        }

        let text = text.trim().to_string();
        debug!(
            "Transcribed {:.2}s of audio into {} chars ({}ms)",
            samples.len() as f32 / WHISPER_SAMPLE_RATE as f32,
            text.len(),
            started.elapsed().as_millis()
        );

        Ok(text)
    }
}
