//! Session coordination.
//!
//! The coordinator turns wake events into an active session, opens the
//! interaction surface and answers chat turns through the router. Model
//! failures never reach the user raw: a missing model becomes download
//! instructions, anything else an apology.

use crate::input::wake_word::{ListenerEvent, WakeEvent};
use crate::lifecycle::ModelError;
use crate::router::{CommandRouter, Reply, Utterance};
use crate::services::Speaker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const APOLOGY: &str =
    "Mi dispiace, non sono riuscito a generare una risposta. Riprova tra poco.";

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("Failed to open {url}: {reason}")]
    Open { url: String, reason: String },
}

/// Where the user interacts once a session starts.
pub trait SessionSurface: Send + Sync {
    fn open(&self) -> Result<(), SurfaceError>;
}

/// Opens a URL in the default browser.
pub struct BrowserSurface {
    url: String,
}

impl BrowserSurface {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl SessionSurface for BrowserSurface {
    fn open(&self) -> Result<(), SurfaceError> {
        info!("Opening {}", self.url);
        open::that(&self.url).map_err(|e| SurfaceError::Open {
            url: self.url.clone(),
            reason: e.to_string(),
        })
    }
}

/// Surface for headless setups: activation only changes state.
pub struct NoSurface;

impl SessionSurface for NoSurface {
    fn open(&self) -> Result<(), SurfaceError> {
        Ok(())
    }
}

/// State of wake phrase detection, as reported by status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum WakeDetection {
    Disabled,
    Listening,
    Failed { reason: String },
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub active: bool,
    pub wake_detection: WakeDetection,
    pub last_wake: Option<DateTime<Utc>>,
    pub sessions_started: u64,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub speak_replies: bool,
    /// Spoken on activation; empty for none.
    pub greeting: String,
}

struct State {
    active: bool,
    wake_detection: WakeDetection,
    last_wake: Option<DateTime<Utc>>,
    sessions_started: u64,
}

pub struct SessionCoordinator {
    router: Arc<CommandRouter>,
    surface: Arc<dyn SessionSurface>,
    speaker: Arc<dyn Speaker>,
    options: SessionOptions,
    state: Mutex<State>,
}

impl SessionCoordinator {
    pub fn new(
        router: Arc<CommandRouter>,
        surface: Arc<dyn SessionSurface>,
        speaker: Arc<dyn Speaker>,
        options: SessionOptions,
    ) -> Self {
        Self {
            router,
            surface,
            speaker,
            options,
            state: Mutex::new(State {
                active: false,
                wake_detection: WakeDetection::Disabled,
                last_wake: None,
                sessions_started: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    pub fn set_wake_detection(&self, detection: WakeDetection) {
        self.state().wake_detection = detection;
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state();
        SessionStatus {
            active: state.active,
            wake_detection: state.wake_detection.clone(),
            last_wake: state.last_wake,
            sessions_started: state.sessions_started,
        }
    }

    /// Start a session. Returns false if one is already active.
    pub fn activate(&self) -> bool {
        {
            let mut state = self.state();
            if state.active {
                debug!("Session already active");
                return false;
            }
            state.active = true;
            state.sessions_started += 1;
        }

        info!("Session started");
        if let Err(e) = self.surface.open() {
            warn!("{}", e);
        }
        if !self.options.greeting.trim().is_empty() {
            self.speaker.speak(&self.options.greeting);
        }
        true
    }

    /// End the current session. Returns false if none was active.
    pub fn end_session(&self) -> bool {
        let was_active = std::mem::replace(&mut self.state().active, false);
        if was_active {
            info!("Session ended");
        }
        was_active
    }

    /// React to one listener event.
    pub fn on_event(&self, event: ListenerEvent) {
        match event {
            ListenerEvent::Wake(WakeEvent { at, text }) => {
                debug!("Wake event: {}", text);
                self.state().last_wake = Some(at);
                self.activate();
            }
            ListenerEvent::ListenerFailed(e) => {
                error!("Wake detection disabled: {}", e);
                self.set_wake_detection(WakeDetection::Failed {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Consume listener events until shutdown or until the sender is gone.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ListenerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        debug!("Listener event channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Session event loop stopped");
    }

    /// Answer one chat turn.
    pub async fn handle_turn(&self, utterance: Utterance) -> Reply {
        let reply = match self.router.handle(utterance).await {
            Ok(reply) => reply,
            Err(e) => model_failure_reply(&e),
        };

        if self.options.speak_replies {
            match &reply {
                Reply::Text(text) => self.speaker.speak(text),
                Reply::Image(_) => self.speaker.speak("Ecco l'immagine che hai chiesto."),
            }
        }

        reply
    }
}

fn model_failure_reply(error: &ModelError) -> Reply {
    match error {
        ModelError::NotFound { tier, path } => {
            warn!("Model missing at {}", path.display());
            Reply::Text(format!(
                "Il modello {} non è installato. Scaricalo con `arcadia model download {}` e riprova.",
                tier.italian_name(),
                tier.name()
            ))
        }
        other => {
            error!("Model failure: {}", other);
            Reply::Text(APOLOGY.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::input::wake_word::ListenerError;
    use crate::lifecycle::tests::StubLoad;
    use crate::router::tests::{fixture, fixture_with};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSurface {
        opens: AtomicUsize,
    }

    impl SessionSurface for CountingSurface {
        fn open(&self) -> Result<(), SurfaceError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSpeaker {
        spoken: Mutex<Vec<String>>,
    }

    impl Speaker for RecordingSpeaker {
        fn speak(&self, text: &str) {
            self.spoken.lock().unwrap().push(text.to_string());
        }
    }

    struct Harness {
        session: Arc<SessionCoordinator>,
        surface: Arc<CountingSurface>,
        speaker: Arc<RecordingSpeaker>,
    }

    fn harness_with(router: CommandRouter, options: SessionOptions) -> Harness {
        let surface = Arc::new(CountingSurface::default());
        let speaker = Arc::new(RecordingSpeaker::default());
        let session = Arc::new(SessionCoordinator::new(
            Arc::new(router),
            surface.clone(),
            speaker.clone(),
            options,
        ));
        Harness {
            session,
            surface,
            speaker,
        }
    }

    fn harness() -> Harness {
        harness_with(
            fixture().router,
            SessionOptions {
                speak_replies: false,
                greeting: "Ciao!".into(),
            },
        )
    }

    fn wake() -> ListenerEvent {
        ListenerEvent::Wake(WakeEvent {
            at: Utc::now(),
            text: "ehi arcadia".into(),
        })
    }

    // ===================
    // Activation
    // ===================

    #[test]
    fn test_wake_activates_once() {
        let h = harness();
        h.session.on_event(wake());
        h.session.on_event(wake());

        assert!(h.session.is_active());
        assert_eq!(h.surface.opens.load(Ordering::SeqCst), 1);
        assert_eq!(*h.speaker.spoken.lock().unwrap(), vec!["Ciao!".to_string()]);

        let status = h.session.status();
        assert_eq!(status.sessions_started, 1);
        assert!(status.last_wake.is_some());
    }

    #[test]
    fn test_end_session_allows_new_activation() {
        let h = harness();
        assert!(!h.session.end_session());
        assert!(h.session.activate());
        assert!(h.session.end_session());
        assert!(!h.session.is_active());

        h.session.on_event(wake());
        assert!(h.session.is_active());
        assert_eq!(h.surface.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_greeting_is_silent() {
        let h = harness_with(
            fixture().router,
            SessionOptions {
                speak_replies: false,
                greeting: "  ".into(),
            },
        );
        h.session.activate();
        assert!(h.speaker.spoken.lock().unwrap().is_empty());
    }

    #[test]
    fn test_surface_failure_still_activates() {
        struct Broken;
        impl SessionSurface for Broken {
            fn open(&self) -> Result<(), SurfaceError> {
                Err(SurfaceError::Open {
                    url: "http://127.0.0.1:5000".into(),
                    reason: "no browser".into(),
                })
            }
        }

        let session = SessionCoordinator::new(
            Arc::new(fixture().router),
            Arc::new(Broken),
            Arc::new(RecordingSpeaker::default()),
            SessionOptions {
                speak_replies: false,
                greeting: String::new(),
            },
        );
        assert!(session.activate());
        assert!(session.is_active());
    }

    #[test]
    fn test_listener_failure_reported() {
        let h = harness();
        h.session.set_wake_detection(WakeDetection::Listening);
        h.session.on_event(ListenerEvent::ListenerFailed(ListenerError::Failed {
            attempts: 6,
            last: "no device".into(),
        }));

        match h.session.status().wake_detection {
            WakeDetection::Failed { reason } => assert!(reason.contains("no device")),
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(!h.session.is_active());
    }

    // ===================
    // Event loop
    // ===================

    #[tokio::test]
    async fn test_run_consumes_events_until_shutdown() {
        let h = harness();
        let (tx, rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(h.session.clone().run(rx, stop_rx));

        tx.send(wake()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !h.session.is_active() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    // ===================
    // Turns
    // ===================

    #[tokio::test]
    async fn test_turn_serves_chat_without_session() {
        let h = harness();
        let reply = h.session.handle_turn(Utterance::new("ciao")).await;
        assert!(reply.render().contains("ciao"));
        assert!(!h.session.is_active());
    }

    #[tokio::test]
    async fn test_missing_model_gives_download_instructions() {
        let f = fixture_with(Config::default(), StubLoad::Missing, false);
        let h = harness_with(
            f.router,
            SessionOptions {
                speak_replies: false,
                greeting: String::new(),
            },
        );
        let reply = h.session.handle_turn(Utterance::new("ciao")).await.render();
        assert!(reply.contains("arcadia model download"));
    }

    #[tokio::test]
    async fn test_model_error_gives_apology() {
        let h = harness();
        let reply = h.session.handle_turn(Utterance::new("boom")).await.render();
        assert_eq!(reply, APOLOGY);
    }

    #[tokio::test]
    async fn test_directive_errors_are_not_apologies() {
        let h = harness();
        let reply = h.session.handle_turn(Utterance::new("@foo")).await.render();
        assert!(reply.contains("@aiuto"));
    }

    #[tokio::test]
    async fn test_speaks_replies_when_enabled() {
        let h = harness_with(
            fixture().router,
            SessionOptions {
                speak_replies: true,
                greeting: String::new(),
            },
        );
        let reply = h.session.handle_turn(Utterance::new("@data")).await.render();

        let spoken = h.speaker.spoken.lock().unwrap();
        assert_eq!(spoken.len(), 1);
        assert_eq!(spoken[0], reply);
    }
}
