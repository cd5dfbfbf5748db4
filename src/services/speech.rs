//! Spoken replies.

use super::Speaker;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Longest reply handed to the TTS command, in characters.
const MAX_SPOKEN_CHARS: usize = 600;

/// Speaks through an external TTS command (e.g. `espeak -v it`).
///
/// The text is passed as the final argument. Each call runs on its own
/// thread so the caller never waits for playback.
#[derive(Debug, Clone)]
pub struct CommandSpeaker {
    program: String,
    args: Vec<String>,
}

impl CommandSpeaker {
    /// Build from a command line; `None` if it is empty.
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl Speaker for CommandSpeaker {
    fn speak(&self, text: &str) {
        let text = spoken_text(text);
        if text.is_empty() {
            return;
        }

        let program = self.program.clone();
        let args = self.args.clone();

        std::thread::spawn(move || {
            debug!("Speaking {} chars via {}", text.len(), program);
            let result = Command::new(&program)
                .args(&args)
                .arg(&text)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .status();

            match result {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("TTS command {} exited with {}", program, status),
                Err(e) => warn!("TTS command {} failed: {}", program, e),
            }
        });
    }
}

/// Logs replies instead of speaking them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSpeaker;

impl Speaker for LogSpeaker {
    fn speak(&self, text: &str) {
        info!("[TTS] {}", text);
    }
}

/// Strip markdown markup and cap the length.
fn spoken_text(text: &str) -> String {
    let plain: String = text
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '`' | '#'))
        .collect();
    let plain = plain.trim();

    match plain.char_indices().nth(MAX_SPOKEN_CHARS) {
        Some((idx, _)) => plain[..idx].to_string(),
        None => plain.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_speaker_requires_program() {
        assert!(CommandSpeaker::new(&[]).is_none());

        let speaker = CommandSpeaker::new(&["espeak".into(), "-v".into(), "it".into()]).unwrap();
        assert_eq!(speaker.program, "espeak");
        assert_eq!(speaker.args, vec!["-v", "it"]);
    }

    #[test]
    fn test_spoken_text_strips_markdown() {
        assert_eq!(spoken_text("**Modello attuale**: `light`"), "Modello attuale: light");
        assert_eq!(spoken_text("   "), "");
    }

    #[test]
    fn test_spoken_text_is_capped() {
        let long = "à".repeat(MAX_SPOKEN_CHARS + 50);
        assert_eq!(spoken_text(&long).chars().count(), MAX_SPOKEN_CHARS);
    }
}
