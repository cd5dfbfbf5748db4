//! Speech-to-text for uploaded clips.

use crate::engine::{WhisperEngine, WhisperError, WhisperModel};
use crate::input::audio::AudioBuffer;
use async_trait::async_trait;
use base64::Engine as _;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum TranscribeError {
    #[error("Speech model unavailable: {0}")]
    ModelMissing(String),

    #[error("Invalid audio: {0}")]
    InvalidAudio(String),

    #[error("Transcription failed: {0}")]
    Failed(String),
}

impl From<WhisperError> for TranscribeError {
    fn from(err: WhisperError) -> Self {
        match err {
            WhisperError::ModelNotFound(..) => Self::ModelMissing(err.to_string()),
            WhisperError::InvalidAudio(msg) => Self::InvalidAudio(msg),
            other => Self::Failed(other.to_string()),
        }
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a WAV clip, given as raw bytes, base64 or a `data:` URL.
    async fn transcribe(&self, audio: &[u8]) -> Result<String, TranscribeError>;
}

/// Extract WAV bytes from a raw, base64 or `data:audio/...;base64,` payload.
pub fn decode_audio_payload(audio: &[u8]) -> Result<Vec<u8>, TranscribeError> {
    if audio.starts_with(b"RIFF") {
        return Ok(audio.to_vec());
    }

    let text = std::str::from_utf8(audio)
        .map_err(|_| TranscribeError::InvalidAudio("payload is neither WAV nor base64".into()))?
        .trim();

    let encoded = match text.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| TranscribeError::InvalidAudio("data URL has no payload".into()))?,
        None => text,
    };

    if encoded.is_empty() {
        return Err(TranscribeError::InvalidAudio("empty audio payload".into()));
    }

    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| TranscribeError::InvalidAudio(format!("bad base64: {e}")))
}

/// Whisper-backed transcriber. The model is loaded on first use unless one
/// is supplied up front.
pub struct WhisperTranscriber {
    model: WhisperModel,
    models_dir: PathBuf,
    language: String,
    engine: OnceCell<Arc<WhisperEngine>>,
}

impl WhisperTranscriber {
    pub fn new(model: WhisperModel, models_dir: PathBuf, language: impl Into<String>) -> Self {
        Self {
            model,
            models_dir,
            language: language.into(),
            engine: OnceCell::new(),
        }
    }

    /// Reuse an already loaded engine.
    pub fn with_engine(mut self, engine: Arc<WhisperEngine>) -> Self {
        self.engine = OnceCell::new_with(Some(engine));
        self
    }

    async fn engine(&self) -> Result<Arc<WhisperEngine>, TranscribeError> {
        let engine = self
            .engine
            .get_or_try_init(|| async {
                let model = self.model;
                let dir = self.models_dir.clone();
                let language = self.language.clone();
                info!("Loading Whisper model '{}' for transcription", model.name());

                let engine = tokio::task::spawn_blocking(move || {
                    WhisperEngine::load(model, &dir, &language)
                })
                .await
                .map_err(|e| TranscribeError::Failed(format!("load task failed: {e}")))??;

                Ok::<_, TranscribeError>(Arc::new(engine))
            })
            .await?;

        Ok(Arc::clone(engine))
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, TranscribeError> {
        let wav = decode_audio_payload(audio)?;
        let buffer = AudioBuffer::from_wav_bytes(&wav)
            .map_err(|e| TranscribeError::InvalidAudio(e.to_string()))?
            .into_whisper_rate();

        if buffer.samples.is_empty() {
            return Err(TranscribeError::InvalidAudio("clip contains no samples".into()));
        }
        debug!("Transcribing {:.1}s clip", buffer.duration_secs());

        let engine = self.engine().await?;
        let text = tokio::task::spawn_blocking(move || engine.transcribe(&buffer.samples))
            .await
            .map_err(|e| TranscribeError::Failed(format!("transcription task failed: {e}")))??;

        Ok(text)
    }
}
