//! External collaborators used by directives and the session.
//!
//! Each capability is a trait so the router and coordinator can be tested
//! with stubs. The concrete implementations talk to public HTTP APIs or the
//! local desktop.

pub mod apps;
pub mod image;
pub mod search;
pub mod speech;
pub mod transcribe;
pub mod weather;

pub use apps::DesktopAppLauncher;
pub use image::CesImageClient;
pub use search::DuckDuckGoSearch;
pub use speech::{CommandSpeaker, LogSpeaker};
pub use transcribe::{TranscribeError, Transcriber, WhisperTranscriber};
pub use weather::WttrWeather;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from external collaborators.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service returned error: {0}")]
    Api(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to launch: {0}")]
    Launch(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// One web search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// An application that can be launched by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledApp {
    /// Display name.
    pub name: String,
    /// Launcher-specific identifier (desktop entry id, bundle path).
    pub package_id: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize)
        -> Result<Vec<SearchResult>, ServiceError>;
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generate an image for `prompt` and return its URL.
    async fn generate_image(&self, prompt: &str) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait WeatherService: Send + Sync {
    /// One-line summary of the current weather at `location`.
    async fn current(&self, location: &str) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait AppLauncher: Send + Sync {
    async fn list_installed_apps(&self) -> Result<Vec<InstalledApp>, ServiceError>;

    async fn launch(&self, package_id: &str) -> Result<(), ServiceError>;
}

/// Text-to-speech output. Fire-and-forget: failures are logged, not returned.
pub trait Speaker: Send + Sync {
    fn speak(&self, text: &str);
}
