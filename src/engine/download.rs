//! Model artifact downloads.
//!
//! Files are streamed to `<name>.part` and renamed once complete, so an
//! interrupted download never looks like an installed model.

use super::{ModelSpec, ModelTier, WhisperModel};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can be downloaded with `arcadia model download <name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Language(ModelTier),
    Whisper(WhisperModel),
}

impl std::str::FromStr for Artifact {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(tier) = s.parse::<ModelTier>() {
            return Ok(Self::Language(tier));
        }
        s.parse::<WhisperModel>()
            .map(Self::Whisper)
            .map_err(|_| {
                format!(
                    "Unknown model '{}'. Use full, balanced, light (language) or tiny, base, small (speech).",
                    s
                )
            })
    }
}

impl Artifact {
    /// (url, destination) pairs this artifact needs.
    pub fn files(&self, models_dir: &Path) -> Vec<(String, PathBuf)> {
        match self {
            Self::Language(tier) => {
                let spec = tier.spec(models_dir);
                vec![
                    (tier.download_url().to_string(), spec.model_path),
                    (ModelSpec::tokenizer_url().to_string(), spec.tokenizer_path),
                ]
            }
            Self::Whisper(model) => {
                vec![(model.download_url(), models_dir.join(model.filename()))]
            }
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Stream `url` to `path`. Returns the number of bytes written.
pub async fn download_file(url: &str, path: &Path) -> Result<u64, DownloadError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        return Err(DownloadError::Status {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }

    let total = response.content_length().unwrap_or(0);
    let partial = partial_path(path);
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    let mut last_percent = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if total > 0 {
            let percent = written * 100 / total;
            if percent >= last_percent + 10 {
                last_percent = percent;
                debug!("{}: {}%", path.display(), percent);
            }
        }
    }

    file.flush().await?;
    drop(file);
    tokio::fs::rename(&partial, path).await?;
    info!("Downloaded {} ({} bytes)", path.display(), written);
    Ok(written)
}

/// Download every missing file of `artifact`. Returns the files fetched.
pub async fn download_artifact(
    artifact: Artifact,
    models_dir: &Path,
) -> Result<Vec<PathBuf>, DownloadError> {
    let mut fetched = Vec::new();
    for (url, path) in artifact.files(models_dir) {
        if path.exists() {
            info!("Already present: {}", path.display());
            continue;
        }
        info!("Downloading {} -> {}", url, path.display());
        download_file(&url, &path).await?;
        fetched.push(path);
    }
    Ok(fetched)
}
