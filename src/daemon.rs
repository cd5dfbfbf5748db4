//! Long-running assistant server.
//!
//! `serve` wires everything together:
//! 1. The model lifecycle manager and its idle eviction timer
//! 2. The command router and its external collaborators
//! 3. The wake phrase listener on its own thread (unless disabled)
//! 4. The session coordinator consuming listener events
//! 5. The REST API and chat page
//!
//! Ctrl-C flips one `watch` channel that stops the timer, the coordinator and
//! the API; the listener thread is stopped through its own flag.

use crate::api::{self, ApiState};
use crate::config::{Config, ConfigError, ConfigStore};
use crate::engine::{OnnxEngine, WhisperEngine, WhisperError, WhisperModel};
use crate::input::{ListenerConfig, MicrophoneSource, WakeListener, WhisperRecognizer};
use crate::lifecycle::{LifecycleConfig, ModelLifecycleManager};
use crate::router::{Collaborators, CommandRouter, Utterance};
use crate::services::{
    CesImageClient, CommandSpeaker, DesktopAppLauncher, DuckDuckGoSearch, LogSpeaker, Speaker,
    WhisperTranscriber, WttrWeather,
};
use crate::session::{
    BrowserSurface, NoSurface, SessionCoordinator, SessionOptions, SessionSurface, WakeDetection,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Whisper error: {0}")]
    Whisper(#[from] WhisperError),

    #[error("Invalid setting: {0}")]
    Setting(String),

    #[error("API server error: {0}")]
    Api(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Components shared by `serve` and one-shot `chat`.
pub struct Assistant {
    pub config: Config,
    pub models_dir: PathBuf,
    pub models: ModelLifecycleManager,
    pub router: Arc<CommandRouter>,
    pub store: Arc<dyn ConfigStore>,
}

impl Assistant {
    /// Build the manager and router. Nothing is loaded yet.
    pub fn build(config: Config, store: Arc<dyn ConfigStore>) -> Result<Self, DaemonError> {
        let models_dir = config.models_dir()?;
        let engine = Arc::new(OnnxEngine::new(config.model.context_length));
        let models = ModelLifecycleManager::new(
            engine,
            LifecycleConfig::from_config(&config.model, models_dir.clone()),
        );
        let router = Arc::new(CommandRouter::new(
            &config,
            models.clone(),
            collaborators(&config, store.clone()),
        ));

        Ok(Self {
            config,
            models_dir,
            models,
            router,
            store,
        })
    }

    /// Session coordinator over this assistant's router.
    pub fn session(&self, surface: Arc<dyn SessionSurface>) -> SessionCoordinator {
        SessionCoordinator::new(
            self.router.clone(),
            surface,
            speaker(&self.config),
            SessionOptions {
                speak_replies: self.config.speech.speak_replies,
                greeting: self.config.speech.greeting.clone(),
            },
        )
    }

    fn whisper_model(&self) -> Result<WhisperModel, DaemonError> {
        self.config
            .wake_word
            .whisper_model
            .parse()
            .map_err(DaemonError::Setting)
    }
}

/// HTTP and desktop collaborators from config.
pub fn collaborators(config: &Config, store: Arc<dyn ConfigStore>) -> Collaborators {
    let services = &config.services;
    let timeout = Duration::from_secs(services.request_timeout_secs);

    Collaborators {
        search: Arc::new(DuckDuckGoSearch::new(&services.search_url, timeout)),
        images: Arc::new(CesImageClient::new(
            &services.image_api_url,
            Duration::from_secs(services.image_timeout_secs),
        )),
        weather: Arc::new(WttrWeather::new(
            &services.weather_url,
            &config.assistant.language,
            timeout,
        )),
        apps: Arc::new(DesktopAppLauncher::new()),
        config_store: store,
    }
}

/// Configured TTS command, or log output when `speech.command` is empty.
pub fn speaker(config: &Config) -> Arc<dyn Speaker> {
    match CommandSpeaker::new(&config.speech.command) {
        Some(speaker) => Arc::new(speaker),
        None => Arc::new(LogSpeaker),
    }
}

/// Answer one message and exit. Used by `arcadia chat`.
pub async fn chat_once(
    config: Config,
    store: Arc<dyn ConfigStore>,
    message: &str,
) -> Result<String, DaemonError> {
    let assistant = Assistant::build(config, store)?;
    let session = assistant.session(Arc::new(NoSurface));
    let reply = session.handle_turn(Utterance::new(message)).await;
    Ok(reply.render())
}

/// The running server.
pub struct Daemon {
    assistant: Assistant,
    wake: bool,
}

impl Daemon {
    pub fn new(assistant: Assistant, wake: bool) -> Self {
        Self { assistant, wake }
    }

    /// Start the listener thread on a loaded Whisper engine.
    fn start_listener(
        &self,
        engine: Arc<WhisperEngine>,
        events: mpsc::Sender<crate::input::ListenerEvent>,
    ) -> Result<WakeListener, DaemonError> {
        let wake = &self.assistant.config.wake_word;
        let frame_secs = wake.frame_secs;
        let recognizer = WhisperRecognizer::new(engine, wake.energy_threshold_db);

        let listener = WakeListener::spawn(
            ListenerConfig::from_config(wake),
            move || MicrophoneSource::open(frame_secs),
            recognizer,
            events,
        )?;
        Ok(listener)
    }

    async fn load_whisper(&self) -> Result<Arc<WhisperEngine>, DaemonError> {
        let model = self.assistant.whisper_model()?;
        let dir = self.assistant.models_dir.clone();
        let language = self.assistant.config.assistant.language.clone();

        let engine = tokio::task::spawn_blocking(move || WhisperEngine::load(model, &dir, &language))
            .await
            .map_err(|e| DaemonError::Setting(format!("whisper load task failed: {e}")))??;
        Ok(Arc::new(engine))
    }

    /// Run until Ctrl-C or until the API server fails.
    pub async fn run(self) -> Result<(), DaemonError> {
        let config = self.assistant.config.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let eviction = self
            .assistant
            .models
            .spawn_eviction_loop(shutdown_rx.clone());

        let surface: Arc<dyn SessionSurface> = if config.api.open_on_wake {
            Arc::new(BrowserSurface::new(config.api.surface_url()))
        } else {
            Arc::new(NoSurface)
        };
        let session = Arc::new(self.assistant.session(surface));

        let mut transcriber = WhisperTranscriber::new(
            self.assistant.whisper_model()?,
            self.assistant.models_dir.clone(),
            config.assistant.language.clone(),
        );

        // Capacity 1: a wake that arrives while one is pending is dropped.
        let (event_tx, event_rx) = mpsc::channel(1);
        let mut listener = None;

        if self.wake && config.wake_word.enabled {
            let started = match self.load_whisper().await {
                Ok(engine) => {
                    transcriber = transcriber.with_engine(engine.clone());
                    self.start_listener(engine, event_tx)
                }
                Err(e) => Err(e),
            };

            match started {
                Ok(l) => {
                    session.set_wake_detection(WakeDetection::Listening);
                    listener = Some(l);
                }
                Err(e) => {
                    warn!("Wake phrase detection unavailable: {}", e);
                    session.set_wake_detection(WakeDetection::Failed {
                        reason: e.to_string(),
                    });
                }
            }
        } else {
            info!("Wake phrase detection disabled");
            drop(event_tx);
        }

        let session_task = tokio::spawn(session.clone().run(event_rx, shutdown_rx.clone()));

        let state = ApiState::new(
            session,
            self.assistant.models.clone(),
            Arc::new(transcriber),
            self.assistant.store.clone(),
            config.api.api_key_hash.clone(),
        );
        let api_config = config.api.clone();
        let api_shutdown = shutdown_rx.clone();
        let mut api_task =
            tokio::spawn(async move { api::serve(state, &api_config, api_shutdown).await });

        info!(
            "{} ready. Say \"{}\" or open {}",
            config.assistant.name,
            config.wake_word.phrase,
            config.api.surface_url()
        );

        let api_result = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                None
            }
            result = &mut api_task => Some(result),
        };

        let _ = shutdown_tx.send(true);

        if let Some(mut listener) = listener {
            if tokio::task::spawn_blocking(move || listener.stop()).await.is_err() {
                error!("Wake listener did not stop cleanly");
            }
        }
        if let Some(handle) = eviction {
            let _ = handle.await;
        }
        let _ = session_task.await;

        let api_result = match api_result {
            Some(result) => result,
            None => api_task.await,
        };
        self.assistant.models.unload();
        info!("Assistant stopped");

        match api_result {
            Ok(result) => result.map_err(DaemonError::from),
            Err(e) => Err(DaemonError::Setting(format!("API task failed: {e}"))),
        }
    }
}

/// Load config and run the server.
pub async fn serve(config: Config, store: Arc<dyn ConfigStore>, wake: bool) -> Result<(), DaemonError> {
    let assistant = Assistant::build(config, store)?;
    Daemon::new(assistant, wake).run().await
}
