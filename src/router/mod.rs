//! Command routing.
//!
//! An utterance is parsed into either a directive (`@cerca gatti`) or a chat
//! message. Directives are looked up in a table of [`DirectiveHandler`]s;
//! their failures become descriptive replies. Chat messages are composed into
//! a prompt and sent to the local model, whose errors are the only ones that
//! propagate.

pub mod command;
pub mod directives;
pub mod policy;
pub mod prompt;

pub use command::{parse, Attachment, Command, Role, Turn, Utterance};
pub use policy::ContentPolicy;

use crate::config::{Config, ConfigStore};
use crate::lifecycle::{ModelError, ModelLifecycleManager};
use crate::services::{AppLauncher, ImageGenerator, WeatherService, WebSearch};
use async_trait::async_trait;
use prompt::PromptParts;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Marks an image reply for the presentation layer.
pub const IMAGE_SENTINEL: &str = "__IMAGE__:";

/// Router output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// URL of a generated image.
    Image(String),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Flatten to a string; images get the sentinel prefix.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Image(url) => write!(f, "{IMAGE_SENTINEL}{url}"),
        }
    }
}

/// Directive failures. Always rendered into a reply, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("Comando non riconosciuto: '{0}'")]
    UnknownDirective(String),

    #[error("{guidance}")]
    MissingArgument { directive: String, guidance: String },

    #[error("Questo prompt non è consentito.")]
    PolicyRejected,

    #[error("Servizio '{service}' non disponibile: {reason}")]
    CollaboratorUnavailable {
        service: &'static str,
        reason: String,
    },

    #[error("{0}")]
    InvalidArgument(String),
}

/// What to ask for when a required argument is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentHint {
    /// e.g. "Specifica cosa cercare"
    pub ask: &'static str,
    /// Sample argument, e.g. "ricetta carbonara"
    pub example: &'static str,
}

impl ArgumentHint {
    /// Full guidance sentence for `prefix` + `name`.
    pub fn render(&self, prefix: char, name: &str) -> String {
        format!(
            "{}, ad esempio `{prefix}{name} {}`.",
            self.ask, self.example
        )
    }
}

/// A directive implementation.
#[async_trait]
pub trait DirectiveHandler: Send + Sync {
    /// One-line description for `@aiuto`.
    fn description(&self) -> &'static str;

    /// Argument placeholder for `@aiuto`, e.g. `<query>`.
    fn usage(&self) -> &'static str {
        ""
    }

    /// Hint shown for an empty argument, if the argument is required.
    fn required_argument(&self) -> Option<ArgumentHint> {
        None
    }

    async fn run(&self, argument: &str) -> Result<Reply, DirectiveError>;
}

/// External collaborators the built-in directives depend on.
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn WebSearch>,
    pub images: Arc<dyn ImageGenerator>,
    pub weather: Arc<dyn WeatherService>,
    pub apps: Arc<dyn AppLauncher>,
    pub config_store: Arc<dyn ConfigStore>,
}

struct Entry {
    names: &'static [&'static str],
    handler: Arc<dyn DirectiveHandler>,
}

/// Parses utterances and routes them to directives or the model.
pub struct CommandRouter {
    prefix: char,
    table: HashMap<&'static str, Arc<dyn DirectiveHandler>>,
    models: ModelLifecycleManager,
    preamble: String,
    history_turns: usize,
    max_new_tokens: usize,
}

impl CommandRouter {
    /// Router with the built-in directive table.
    pub fn new(config: &Config, models: ModelLifecycleManager, collaborators: Collaborators) -> Self {
        use directives::*;

        let entries = vec![
            Entry {
                names: &["info"],
                handler: Arc::new(InfoDirective::new(config.assistant.clone(), models.clone())),
            },
            Entry {
                names: &["data"],
                handler: Arc::new(DateDirective),
            },
            Entry {
                names: &["codice_sorgente"],
                handler: Arc::new(SourceDirective::new(config.assistant.repository.clone())),
            },
            Entry {
                names: &["modello"],
                handler: Arc::new(ModelDirective::new(
                    models.clone(),
                    Arc::clone(&collaborators.config_store),
                    config.router.prefix,
                )),
            },
            Entry {
                names: &["cerca"],
                handler: Arc::new(SearchDirective::new(
                    Arc::clone(&collaborators.search),
                    config.router.search_results,
                )),
            },
            Entry {
                names: &["immagine"],
                handler: Arc::new(ImageDirective::new(
                    Arc::clone(&collaborators.images),
                    ContentPolicy::new(&config.router.denylist),
                )),
            },
            Entry {
                names: &["app", "apri"],
                handler: Arc::new(AppDirective::new(Arc::clone(&collaborators.apps))),
            },
            Entry {
                names: &["mappe"],
                handler: Arc::new(MapDirective),
            },
            Entry {
                names: &["meteo"],
                handler: Arc::new(WeatherDirective::new(Arc::clone(&collaborators.weather))),
            },
        ];

        let prefix = config.router.prefix;
        let help = HelpDirective::new(help_text(prefix, &entries));

        let mut table: HashMap<&'static str, Arc<dyn DirectiveHandler>> = HashMap::new();
        table.insert("aiuto", Arc::new(help));
        for entry in &entries {
            for &name in entry.names {
                table.insert(name, Arc::clone(&entry.handler));
            }
        }

        info!("Command router ready ({} directives)", table.len());

        Self {
            prefix,
            table,
            models,
            preamble: prompt::system_preamble(&config.assistant),
            history_turns: config.router.history_turns,
            max_new_tokens: config.model.max_new_tokens,
        }
    }

    pub fn prefix(&self) -> char {
        self.prefix
    }

    pub fn parse(&self, utterance: Utterance) -> Command {
        parse(utterance, self.prefix)
    }

    /// Parse and dispatch in one step.
    pub async fn handle(&self, utterance: Utterance) -> Result<Reply, ModelError> {
        self.dispatch(self.parse(utterance)).await
    }

    /// Run a command. Only model lifecycle errors are returned.
    pub async fn dispatch(&self, command: Command) -> Result<Reply, ModelError> {
        match command {
            Command::Directive { name, argument } => {
                Ok(match self.run_directive(&name, &argument).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        debug!("Directive '{}' failed: {}", name, e);
                        self.render_error(&e)
                    }
                })
            }
            Command::Chat {
                text,
                history,
                attachments,
            } => self.chat(&text, &history, &attachments).await,
        }
    }

    /// Look up and run a directive.
    pub async fn run_directive(&self, name: &str, argument: &str) -> Result<Reply, DirectiveError> {
        let handler = self
            .table
            .get(name)
            .ok_or_else(|| DirectiveError::UnknownDirective(name.to_string()))?;

        if argument.is_empty() {
            if let Some(hint) = handler.required_argument() {
                return Err(DirectiveError::MissingArgument {
                    directive: name.to_string(),
                    guidance: hint.render(self.prefix, name),
                });
            }
        }

        debug!("Running directive '{}'", name);
        handler.run(argument).await
    }

    fn render_error(&self, err: &DirectiveError) -> Reply {
        let hint = format!("Usa `{}aiuto` per vedere i comandi disponibili.", self.prefix);
        match err {
            DirectiveError::UnknownDirective(name) if name.is_empty() => {
                Reply::Text(format!("Manca il nome del comando. {hint}"))
            }
            DirectiveError::UnknownDirective(name) => Reply::Text(format!(
                "Comando non riconosciuto: {}{}. {hint}",
                self.prefix, name
            )),
            DirectiveError::CollaboratorUnavailable { .. } => {
                warn!("{}", err);
                Reply::Text(format!("{err}. Riprova più tardi."))
            }
            other => Reply::Text(other.to_string()),
        }
    }

    async fn chat(
        &self,
        text: &str,
        history: &[Turn],
        attachments: &[Attachment],
    ) -> Result<Reply, ModelError> {
        if text.is_empty() && attachments.is_empty() {
            return Ok(Reply::Text(format!(
                "Scrivi un messaggio, oppure usa `{}aiuto` per vedere i comandi.",
                self.prefix
            )));
        }

        let user = prompt::user_content(text, attachments);
        let parts = PromptParts::new(&self.preamble, history, self.history_turns, &user);

        let lease = self.models.acquire().await?;
        let counts = lease.count_tokens(parts.segments()).await?;
        let budget = lease.context_length().saturating_sub(self.max_new_tokens);
        let prompt = parts.assemble(&counts, budget);

        debug!(
            "Chat prompt: {} of {} history turns, {} tokens budget",
            prompt.matches("<|end|>").count().saturating_sub(2),
            parts.history.len(),
            budget
        );

        let reply = lease.generate(prompt, self.max_new_tokens).await?;
        if reply.trim().is_empty() {
            return Ok(Reply::text("Non ho una risposta per questo, prova a riformulare."));
        }
        Ok(Reply::Text(reply))
    }
}

fn help_text(prefix: char, entries: &[Entry]) -> String {
    let mut text = String::from("Comandi disponibili:\n");
    text.push_str(&format!("- `{prefix}aiuto`: Mostra i comandi\n"));

    for entry in entries {
        let Some((name, aliases)) = entry.names.split_first() else {
            continue;
        };
        let usage = entry.handler.usage();
        let invocation = if usage.is_empty() {
            format!("{prefix}{name}")
        } else {
            format!("{prefix}{name} {usage}")
        };
        text.push_str(&format!("- `{invocation}`: {}", entry.handler.description()));
        for alias in aliases {
            text.push_str(&format!(" (anche `{prefix}{alias}`)"));
        }
        text.push('\n');
    }

    text.trim_end().to_string()
}
