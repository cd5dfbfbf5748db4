//! Built-in directives.

use super::{ArgumentHint, ContentPolicy, DirectiveError, DirectiveHandler, Reply};
use crate::config::{persist_model_tier, AssistantConfig, ConfigStore};
use crate::engine::ModelTier;
use crate::lifecycle::ModelLifecycleManager;
use crate::services::apps::find_app;
use crate::services::{AppLauncher, ImageGenerator, WeatherService, WebSearch};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

const OSM_SEARCH_URL: &str = "https://www.openstreetmap.org/search";

/// `@aiuto`
pub struct HelpDirective {
    text: String,
}

impl HelpDirective {
    pub fn new(text: String) -> Self {
        Self { text }
    }
}

#[async_trait]
impl DirectiveHandler for HelpDirective {
    fn description(&self) -> &'static str {
        "Mostra i comandi"
    }

    async fn run(&self, _argument: &str) -> Result<Reply, DirectiveError> {
        Ok(Reply::Text(self.text.clone()))
    }
}

/// `@info`
pub struct InfoDirective {
    identity: AssistantConfig,
    models: ModelLifecycleManager,
}

impl InfoDirective {
    pub fn new(identity: AssistantConfig, models: ModelLifecycleManager) -> Self {
        Self { identity, models }
    }
}

#[async_trait]
impl DirectiveHandler for InfoDirective {
    fn description(&self) -> &'static str {
        "Informazioni sull'assistente"
    }

    async fn run(&self, _argument: &str) -> Result<Reply, DirectiveError> {
        let tier = self.models.status().tier;
        Ok(Reply::Text(format!(
            "**{} v{}**\n- Creatore: {}\n- Modello: Phi-3-mini ({})\n- Licenza: MPL 2.0\n- Codice sorgente: {}",
            self.identity.name,
            env!("CARGO_PKG_VERSION"),
            self.identity.creator,
            tier.italian_name(),
            self.identity.repository
        )))
    }
}

/// `@data`
pub struct DateDirective;

#[async_trait]
impl DirectiveHandler for DateDirective {
    fn description(&self) -> &'static str {
        "Mostra data e ora"
    }

    async fn run(&self, _argument: &str) -> Result<Reply, DirectiveError> {
        let now = chrono::Local::now();
        Ok(Reply::Text(format!("Oggi è {}", now.format("%d/%m/%Y, %H:%M"))))
    }
}

/// `@codice_sorgente`
pub struct SourceDirective {
    repository: String,
}

impl SourceDirective {
    pub fn new(repository: String) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl DirectiveHandler for SourceDirective {
    fn description(&self) -> &'static str {
        "Link al codice sorgente"
    }

    async fn run(&self, _argument: &str) -> Result<Reply, DirectiveError> {
        Ok(Reply::Text(format!(
            "[Codice sorgente]({})",
            self.repository
        )))
    }
}

/// `@modello [tier]`: show or change the model tier.
pub struct ModelDirective {
    models: ModelLifecycleManager,
    store: Arc<dyn ConfigStore>,
    prefix: char,
}

impl ModelDirective {
    pub fn new(models: ModelLifecycleManager, store: Arc<dyn ConfigStore>, prefix: char) -> Self {
        Self {
            models,
            store,
            prefix,
        }
    }

    fn overview(&self) -> String {
        let current = self.models.status().tier;
        let mut text = format!("**Modello attuale**: {}\n\nDisponibili:\n", current.italian_name());
        for tier in ModelTier::ALL {
            text.push_str(&format!(
                "- `{}modello {}`: {}\n",
                self.prefix,
                tier.italian_name(),
                tier.description()
            ));
        }
        text.push_str("\nSe il modello non è presente, scaricalo con `arcadia model download <versione>`.");
        text
    }

}

#[async_trait]
impl DirectiveHandler for ModelDirective {
    fn description(&self) -> &'static str {
        "Mostra o cambia la versione del modello"
    }

    fn usage(&self) -> &'static str {
        "[completa|bilanciata|leggera]"
    }

    async fn run(&self, argument: &str) -> Result<Reply, DirectiveError> {
        if argument.is_empty() {
            return Ok(Reply::Text(self.overview()));
        }

        let tier: ModelTier = argument.parse().map_err(|_| {
            DirectiveError::InvalidArgument(format!(
                "Usa: `{}modello [completa|bilanciata|leggera]`",
                self.prefix
            ))
        })?;

        let outcome = self.models.configure(tier);
        let mut text = format!("Modello impostato su **{}**.", tier.italian_name());

        if outcome.reload_required {
            text.push_str(" Verrà usato al prossimo caricamento del modello.");
        }

        // A failed save does not undo the switch.
        if let Err(e) = persist_model_tier(Arc::clone(&self.store), tier).await {
            warn!("Failed to persist model tier: {}", e);
            text.push_str(" Attenzione: la scelta non è stata salvata.");
        }

        Ok(Reply::Text(text))
    }
}

/// `@cerca <query>`
pub struct SearchDirective {
    search: Arc<dyn WebSearch>,
    max_results: usize,
}

impl SearchDirective {
    pub fn new(search: Arc<dyn WebSearch>, max_results: usize) -> Self {
        Self {
            search,
            max_results,
        }
    }
}

#[async_trait]
impl DirectiveHandler for SearchDirective {
    fn description(&self) -> &'static str {
        "Cerca sul web"
    }

    fn usage(&self) -> &'static str {
        "<query>"
    }

    fn required_argument(&self) -> Option<ArgumentHint> {
        Some(ArgumentHint {
            ask: "Specifica cosa cercare",
            example: "ricetta carbonara",
        })
    }

    async fn run(&self, argument: &str) -> Result<Reply, DirectiveError> {
        let results = self
            .search
            .search(argument, self.max_results)
            .await
            .map_err(|e| DirectiveError::CollaboratorUnavailable {
                service: "ricerca",
                reason: e.to_string(),
            })?;

        if results.is_empty() {
            return Ok(Reply::Text(format!("Nessun risultato per \"{argument}\".")));
        }

        let lines: Vec<String> = results
            .iter()
            .map(|r| format!("- [{}]({})", r.title, r.url))
            .collect();
        Ok(Reply::Text(lines.join("\n")))
    }
}

/// `@immagine <descrizione>`
pub struct ImageDirective {
    images: Arc<dyn ImageGenerator>,
    policy: ContentPolicy,
}

impl ImageDirective {
    pub fn new(images: Arc<dyn ImageGenerator>, policy: ContentPolicy) -> Self {
        Self { images, policy }
    }
}

#[async_trait]
impl DirectiveHandler for ImageDirective {
    fn description(&self) -> &'static str {
        "Genera un'immagine"
    }

    fn usage(&self) -> &'static str {
        "<descrizione>"
    }

    fn required_argument(&self) -> Option<ArgumentHint> {
        Some(ArgumentHint {
            ask: "Specifica cosa disegnare",
            example: "un gatto astronauta",
        })
    }

    async fn run(&self, argument: &str) -> Result<Reply, DirectiveError> {
        if let Some(term) = self.policy.violation(argument) {
            info!("Image prompt rejected by denylist term '{}'", term);
            return Err(DirectiveError::PolicyRejected);
        }

        let url = self
            .images
            .generate_image(argument)
            .await
            .map_err(|e| DirectiveError::CollaboratorUnavailable {
                service: "immagini",
                reason: e.to_string(),
            })?;

        Ok(Reply::Image(url))
    }
}

/// `@app <nome>` / `@apri <nome>`
pub struct AppDirective {
    apps: Arc<dyn AppLauncher>,
}

impl AppDirective {
    pub fn new(apps: Arc<dyn AppLauncher>) -> Self {
        Self { apps }
    }
}

#[async_trait]
impl DirectiveHandler for AppDirective {
    fn description(&self) -> &'static str {
        "Apri un'app installata"
    }

    fn usage(&self) -> &'static str {
        "<nome>"
    }

    fn required_argument(&self) -> Option<ArgumentHint> {
        Some(ArgumentHint {
            ask: "Specifica quale app aprire",
            example: "firefox",
        })
    }

    async fn run(&self, argument: &str) -> Result<Reply, DirectiveError> {
        let unavailable = |e: crate::services::ServiceError| DirectiveError::CollaboratorUnavailable {
            service: "app",
            reason: e.to_string(),
        };

        let installed = self.apps.list_installed_apps().await.map_err(unavailable)?;
        let Some(app) = find_app(&installed, argument) else {
            return Ok(Reply::Text(format!("App '{argument}' non trovata.")));
        };

        self.apps.launch(&app.package_id).await.map_err(unavailable)?;
        Ok(Reply::Text(format!("Aperto {}.", app.name)))
    }
}

/// `@mappe <luogo>`
pub struct MapDirective;

#[async_trait]
impl DirectiveHandler for MapDirective {
    fn description(&self) -> &'static str {
        "Mostra un luogo sulla mappa"
    }

    fn usage(&self) -> &'static str {
        "<luogo>"
    }

    fn required_argument(&self) -> Option<ArgumentHint> {
        Some(ArgumentHint {
            ask: "Specifica un luogo",
            example: "Colosseo",
        })
    }

    async fn run(&self, argument: &str) -> Result<Reply, DirectiveError> {
        let url = reqwest::Url::parse_with_params(OSM_SEARCH_URL, &[("query", argument)])
            .map_err(|e| DirectiveError::InvalidArgument(format!("Luogo non valido: {e}")))?;
        Ok(Reply::Text(format!("[Mappa di {argument}]({url})")))
    }
}

/// `@meteo <città>`
pub struct WeatherDirective {
    weather: Arc<dyn WeatherService>,
}

impl WeatherDirective {
    pub fn new(weather: Arc<dyn WeatherService>) -> Self {
        Self { weather }
    }
}

#[async_trait]
impl DirectiveHandler for WeatherDirective {
    fn description(&self) -> &'static str {
        "Meteo attuale di una città"
    }

    fn usage(&self) -> &'static str {
        "<città>"
    }

    fn required_argument(&self) -> Option<ArgumentHint> {
        Some(ArgumentHint {
            ask: "Specifica una città",
            example: "Milano",
        })
    }

    async fn run(&self, argument: &str) -> Result<Reply, DirectiveError> {
        let summary = self.weather.current(argument).await.map_err(|e| {
            DirectiveError::CollaboratorUnavailable {
                service: "meteo",
                reason: e.to_string(),
            }
        })?;
        Ok(Reply::Text(summary))
    }
}
