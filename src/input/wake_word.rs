//! Wake phrase detection.
//!
//! A dedicated OS thread reads fixed-size frames from an [`AudioSource`],
//! runs them through a [`PhraseRecognizer`] and looks for the configured
//! phrase in the recognized text. Each match raises one [`WakeEvent`];
//! further matches are ignored until the cooldown has passed.
//!
//! Device and recognizer backend errors are retried with exponential
//! backoff. After too many consecutive failures the listener stops and
//! reports [`ListenerEvent::ListenerFailed`].

use super::audio::{rms_db, AudioSource, CaptureError};
use crate::config::WakeWordConfig;
use crate::engine::{WhisperEngine, WhisperError};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Longest backoff between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Granularity of shutdown checks while backing off.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecognizeError {
    /// Audio contained no recognizable speech.
    #[error("Audio was unintelligible")]
    Unintelligible,

    #[error("Recognizer failed: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ListenerError {
    #[error("Wake listener stopped after {attempts} consecutive failures: {last}")]
    Failed { attempts: u32, last: String },
}

/// The wake phrase was heard.
#[derive(Debug, Clone)]
pub struct WakeEvent {
    pub at: DateTime<Utc>,
    /// Full recognized text of the frame.
    pub text: String,
}

/// Events sent from the listener thread to the session.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    Wake(WakeEvent),
    ListenerFailed(ListenerError),
}

/// Offline speech-to-text over one frame of 16kHz mono audio.
pub trait PhraseRecognizer: Send {
    /// `Ok(None)` when the frame holds nothing worth matching.
    fn recognize(&mut self, frame: &[f32]) -> Result<Option<String>, RecognizeError>;
}

/// Listener tuning.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub phrase: String,
    pub cooldown: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl ListenerConfig {
    pub fn from_config(config: &WakeWordConfig) -> Self {
        Self {
            phrase: config.phrase.clone(),
            cooldown: Duration::from_secs_f32(config.cooldown_secs.max(0.0)),
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.retry_backoff_ms),
            backoff_cap: MAX_BACKOFF,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// Lowercase, drop punctuation, collapse whitespace.
fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Matches recognized text against the wake phrase with a cooldown.
#[derive(Debug)]
pub struct PhraseMatcher {
    phrase: String,
    cooldown: Duration,
    last_match: Option<Instant>,
}

impl PhraseMatcher {
    pub fn new(phrase: &str, cooldown: Duration) -> Self {
        Self {
            phrase: normalize(phrase),
            cooldown,
            last_match: None,
        }
    }

    /// True when `text` contains the phrase and the cooldown has passed.
    pub fn observe(&mut self, text: &str, now: Instant) -> bool {
        if self.phrase.is_empty() || !normalize(text).contains(&self.phrase) {
            return false;
        }

        if let Some(last) = self.last_match {
            if now.saturating_duration_since(last) < self.cooldown {
                debug!("Wake phrase ignored during cooldown");
                return false;
            }
        }

        self.last_match = Some(now);
        true
    }
}

/// Handle to the listener thread. Dropping it stops the thread.
pub struct WakeListener {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WakeListener {
    /// Start listening on a new thread.
    ///
    /// `open_source` runs on the listener thread, so sources that are not
    /// `Send` (cpal streams) can be used. It is called again to reopen the
    /// source after a read error.
    pub fn spawn<S, F, R>(
        config: ListenerConfig,
        open_source: F,
        recognizer: R,
        events: mpsc::Sender<ListenerEvent>,
    ) -> std::io::Result<Self>
    where
        S: AudioSource,
        F: FnMut() -> Result<S, CaptureError> + Send + 'static,
        R: PhraseRecognizer + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let thread = std::thread::Builder::new()
            .name("wake-listener".into())
            .spawn(move || {
                let worker = ListenerLoop {
                    matcher: PhraseMatcher::new(&config.phrase, config.cooldown),
                    config,
                    recognizer,
                    events,
                    shutdown: flag,
                };
                worker.run(open_source);
            })?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Whether the thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the thread and wait for it to exit.
    ///
    /// Waits at most one frame read plus one shutdown poll.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Wake listener thread panicked");
            }
        }
    }
}

impl Drop for WakeListener {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

struct ListenerLoop<R> {
    config: ListenerConfig,
    matcher: PhraseMatcher,
    recognizer: R,
    events: mpsc::Sender<ListenerEvent>,
    shutdown: Arc<AtomicBool>,
}

impl<R: PhraseRecognizer> ListenerLoop<R> {
    fn stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn run<S, F>(mut self, mut open_source: F)
    where
        S: AudioSource,
        F: FnMut() -> Result<S, CaptureError>,
    {
        info!("Listening for wake phrase \"{}\"", self.config.phrase);
        let mut source: Option<S> = None;
        let mut failures = 0u32;

        while !self.stopped() {
            if source.is_none() {
                match open_source() {
                    Ok(s) => source = Some(s),
                    Err(e) => {
                        if !self.retry(&mut failures, e.to_string()) {
                            return;
                        }
                        continue;
                    }
                }
            }
            let Some(active) = source.as_mut() else {
                continue;
            };

            let frame = match active.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    source = None;
                    if !self.retry(&mut failures, e.to_string()) {
                        return;
                    }
                    continue;
                }
            };

            // A full read-and-recognize cycle clears the failure count.
            let text = match self.recognizer.recognize(&frame) {
                Ok(Some(text)) => {
                    failures = 0;
                    text
                }
                Ok(None) | Err(RecognizeError::Unintelligible) => {
                    failures = 0;
                    continue;
                }
                Err(RecognizeError::Backend(reason)) => {
                    if !self.retry(&mut failures, reason) {
                        return;
                    }
                    continue;
                }
            };

            debug!("Heard: {}", text);
            if self.matcher.observe(&text, Instant::now()) && !self.signal(text) {
                return;
            }
        }

        info!("Wake listener stopped");
    }

    /// Send a wake event. False when nobody is listening any more.
    fn signal(&self, text: String) -> bool {
        info!("Wake phrase detected");
        let event = ListenerEvent::Wake(WakeEvent {
            at: Utc::now(),
            text,
        });

        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Previous wake event still pending, dropping this one");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                info!("Wake event receiver closed");
                false
            }
        }
    }

    /// Count a failure and back off. False when the listener must give up.
    fn retry(&self, failures: &mut u32, reason: String) -> bool {
        *failures += 1;

        if *failures > self.config.max_retries {
            error!(
                "Wake listener giving up after {} failures: {}",
                failures, reason
            );
            let failed = ListenerError::Failed {
                attempts: *failures,
                last: reason,
            };
            if self
                .events
                .blocking_send(ListenerEvent::ListenerFailed(failed))
                .is_err()
            {
                debug!("Listener failure not delivered, receiver closed");
            }
            return false;
        }

        let delay = self.config.backoff(*failures);
        warn!(
            "Wake listener error ({}/{}), retrying in {:?}: {}",
            failures, self.config.max_retries, delay, reason
        );
        self.sleep(delay)
    }

    /// Sleep unless shutdown is requested. False on shutdown.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if self.stopped() {
                return false;
            }
            std::thread::sleep(SHUTDOWN_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
        !self.stopped()
    }
}

/// Whisper-based recognizer that skips near-silent frames.
pub struct WhisperRecognizer {
    engine: Arc<WhisperEngine>,
    energy_threshold_db: f32,
}

impl WhisperRecognizer {
    pub fn new(engine: Arc<WhisperEngine>, energy_threshold_db: f32) -> Self {
        Self {
            engine,
            energy_threshold_db,
        }
    }
}

impl PhraseRecognizer for WhisperRecognizer {
    fn recognize(&mut self, frame: &[f32]) -> Result<Option<String>, RecognizeError> {
        if !passes_energy_gate(frame, self.energy_threshold_db) {
            return Ok(None);
        }

        match self.engine.transcribe(frame) {
            Ok(text) => Ok(clean_transcript(&text)),
            Err(WhisperError::InvalidAudio(_)) => Err(RecognizeError::Unintelligible),
            Err(e) => Err(RecognizeError::Backend(e.to_string())),
        }
    }
}

fn passes_energy_gate(frame: &[f32], threshold_db: f32) -> bool {
    !frame.is_empty() && rms_db(frame) >= threshold_db
}

/// Drop empty output and non-speech annotations such as `[BLANK_AUDIO]`.
fn clean_transcript(text: &str) -> Option<String> {
    let text = text.trim();
    let annotation = (text.starts_with('[') && text.ends_with(']'))
        || (text.starts_with('(') && text.ends_with(')'));
    if text.is_empty() || annotation {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // ===================
    // Matching
    // ===================

    #[test]
    fn test_normalize_strips_punctuation() {
        assert_eq!(normalize("  Ehi,   ARCADIA! "), "ehi arcadia");
    }

    #[test]
    fn test_matcher_substring_case_insensitive() {
        let mut matcher = PhraseMatcher::new("ehi arcadia", Duration::ZERO);
        assert!(matcher.observe("Allora, Ehi Arcadia, che ore sono?", Instant::now()));
        assert!(!matcher.observe("ciao a tutti", Instant::now()));
    }

    #[test]
    fn test_matcher_cooldown() {
        let mut matcher = PhraseMatcher::new("ehi arcadia", Duration::from_millis(500));
        let start = Instant::now();
        assert!(matcher.observe("ehi arcadia", start));
        assert!(!matcher.observe("ehi arcadia", start + Duration::from_millis(100)));
        assert!(matcher.observe("ehi arcadia", start + Duration::from_millis(600)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ListenerConfig::from_config(&WakeWordConfig::default());
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_millis(1000));
        assert_eq!(config.backoff(4), Duration::from_millis(4000));
        assert_eq!(config.backoff(5), Duration::from_secs(8));
        assert_eq!(config.backoff(30), Duration::from_secs(8));
    }

    // ===================
    // Recognizer helpers
    // ===================

    #[test]
    fn test_energy_gate() {
        assert!(!passes_energy_gate(&[], -45.0));
        assert!(!passes_energy_gate(&vec![0.0; 1600], -45.0));
        assert!(passes_energy_gate(&vec![0.3; 1600], -45.0));
    }

    #[test]
    fn test_clean_transcript() {
        assert_eq!(clean_transcript(" [BLANK_AUDIO] "), None);
        assert_eq!(clean_transcript("(musica)"), None);
        assert_eq!(clean_transcript("   "), None);
        assert_eq!(clean_transcript(" Ehi Arcadia. "), Some("Ehi Arcadia.".into()));
    }

    // ===================
    // Listener thread
    // ===================

    /// Frames are scripted results; the queue survives reopening.
    #[derive(Clone)]
    enum Step {
        Frame,
        DeviceError,
    }

    struct ScriptedSource {
        steps: Arc<Mutex<VecDeque<Step>>>,
    }

    impl AudioSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<Vec<f32>, CaptureError> {
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Frame) => Ok(vec![0.1; 160]),
                Some(Step::DeviceError) => Err(CaptureError::StreamError("unplugged".into())),
                None => {
                    std::thread::sleep(Duration::from_millis(10));
                    Ok(vec![0.0; 160])
                }
            }
        }
    }

    /// Returns the scripted transcripts in order, then nothing.
    struct ScriptedRecognizer {
        texts: VecDeque<Result<Option<String>, RecognizeError>>,
    }

    impl PhraseRecognizer for ScriptedRecognizer {
        fn recognize(&mut self, _frame: &[f32]) -> Result<Option<String>, RecognizeError> {
            self.texts.pop_front().unwrap_or(Ok(None))
        }
    }

    fn fast_config(cooldown: Duration) -> ListenerConfig {
        ListenerConfig {
            phrase: "ehi arcadia".into(),
            cooldown,
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
        }
    }

    fn spawn_scripted(
        config: ListenerConfig,
        steps: Vec<Step>,
        texts: Vec<Result<Option<String>, RecognizeError>>,
    ) -> (WakeListener, mpsc::Receiver<ListenerEvent>) {
        let (tx, rx) = mpsc::channel(1);
        let steps = Arc::new(Mutex::new(VecDeque::from(steps)));
        let listener = WakeListener::spawn(
            config,
            move || {
                Ok(ScriptedSource {
                    steps: steps.clone(),
                })
            },
            ScriptedRecognizer {
                texts: texts.into(),
            },
            tx,
        )
        .unwrap();
        (listener, rx)
    }

    #[tokio::test]
    async fn test_one_event_per_match() {
        let texts = vec![
            Ok(Some("buongiorno".to_string())),
            Ok(Some("Ehi Arcadia!".to_string())),
            Err(RecognizeError::Unintelligible),
        ];
        let steps = vec![Step::Frame, Step::Frame, Step::Frame];
        let (mut listener, mut rx) = spawn_scripted(fast_config(Duration::ZERO), steps, texts);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ListenerEvent::Wake(wake) => assert_eq!(wake.text, "Ehi Arcadia!"),
            other => panic!("unexpected event: {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        listener.stop();
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_no_second_event_within_cooldown() {
        let texts = vec![
            Ok(Some("ehi arcadia".to_string())),
            Ok(Some("ehi arcadia".to_string())),
        ];
        let steps = vec![Step::Frame, Step::Frame];
        let (mut listener, mut rx) =
            spawn_scripted(fast_config(Duration::from_secs(60)), steps, texts);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(matches!(first, Some(ListenerEvent::Wake(_))));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        listener.stop();
    }

    #[tokio::test]
    async fn test_recovers_from_transient_device_error() {
        let steps = vec![Step::DeviceError, Step::DeviceError, Step::Frame];
        let texts = vec![Ok(Some("ehi arcadia".to_string()))];
        let (mut listener, mut rx) = spawn_scripted(fast_config(Duration::ZERO), steps, texts);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(ListenerEvent::Wake(_))));
        listener.stop();
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_retries() {
        let steps = vec![Step::DeviceError; 3];
        let (mut listener, mut rx) = spawn_scripted(fast_config(Duration::ZERO), steps, vec![]);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        match event {
            Some(ListenerEvent::ListenerFailed(ListenerError::Failed { attempts, last })) => {
                assert_eq!(attempts, 3);
                assert!(last.contains("unplugged"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        listener.stop();
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_backend_errors_count_as_failures() {
        let texts = vec![
            Err(RecognizeError::Backend("gpu lost".into())),
            Err(RecognizeError::Backend("gpu lost".into())),
            Err(RecognizeError::Backend("gpu lost".into())),
        ];
        let steps = vec![Step::Frame, Step::Frame, Step::Frame];
        let (mut listener, mut rx) = spawn_scripted(fast_config(Duration::ZERO), steps, texts);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(ListenerEvent::ListenerFailed(_))));
        listener.stop();
    }

    #[tokio::test]
    async fn test_open_failure_retries_then_fails() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut listener = WakeListener::spawn(
            fast_config(Duration::ZERO),
            || Err::<ScriptedSource, _>(CaptureError::NoInputDevice),
            ScriptedRecognizer {
                texts: VecDeque::new(),
            },
            tx,
        )
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(ListenerEvent::ListenerFailed(_))));
        listener.stop();
    }
}
