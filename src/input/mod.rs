//! Input handling: audio capture and wake phrase detection.

pub mod audio;
pub mod wake_word;

pub use audio::{AudioBuffer, AudioSource, CaptureError, MicrophoneSource};
pub use wake_word::{
    ListenerConfig, ListenerError, ListenerEvent, PhraseRecognizer, WakeEvent, WakeListener,
    WhisperRecognizer,
};
