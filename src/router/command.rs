//! Utterances and their parsed form.

use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single turn in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Opaque file sent along with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub mime: Option<String>,
    /// Text for text attachments; anything else is passed through untouched.
    #[serde(default)]
    pub content: String,
}

impl Attachment {
    /// Whether the content can be quoted into a prompt.
    pub fn is_text(&self) -> bool {
        if let Some(mime) = &self.mime {
            return mime.starts_with("text/");
        }
        let name = self.name.to_lowercase();
        name.ends_with(".txt") || name.ends_with(".md")
    }
}

/// One incoming message with its context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    pub attachments: Vec<Attachment>,
    /// Oldest first.
    pub history: Vec<Turn>,
}

impl Utterance {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Parsed utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Free-form message for the language model.
    Chat {
        text: String,
        history: Vec<Turn>,
        attachments: Vec<Attachment>,
    },
    /// Structured command: `@name argument`.
    Directive { name: String, argument: String },
}

/// Split an utterance into a directive or a chat message.
///
/// Leading whitespace is ignored. After the prefix, the first
/// whitespace-delimited token (lowercased) is the name and the trimmed
/// remainder is the argument.
pub fn parse(utterance: Utterance, prefix: char) -> Command {
    if let Some(rest) = utterance.text.trim_start().strip_prefix(prefix) {
        let rest = rest.trim_end();
        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };
        return Command::Directive {
            name: name.to_lowercase(),
            argument: argument.to_string(),
        };
    }

    Command::Chat {
        text: utterance.text.trim().to_string(),
        history: utterance.history,
        attachments: utterance.attachments,
    }
}
