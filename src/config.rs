use crate::engine::ModelTier;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Assistant identity shown by `@info` and used in the system preamble
    #[serde(default)]
    pub assistant: AssistantConfig,

    /// Local language model settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Directive parsing and chat prompt settings
    #[serde(default)]
    pub router: RouterConfig,

    /// Wake phrase detection settings ("Ehi Arcadia")
    #[serde(default)]
    pub wake_word: WakeWordConfig,

    /// Spoken replies
    #[serde(default)]
    pub speech: SpeechConfig,

    /// External HTTP services (search, image generation, weather)
    #[serde(default)]
    pub services: ServicesConfig,

    /// REST API server settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Prefer cloud back-ends when API keys are configured
    #[serde(default)]
    pub use_cloud: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write a daily-rotated log file to the data directory
    #[serde(default)]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Assistant identity.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AssistantConfig {
    #[serde(default = "default_assistant_name")]
    pub name: String,

    #[serde(default = "default_creator")]
    pub creator: String,

    #[serde(default = "default_repository")]
    pub repository: String,

    /// Language used for the system preamble and spoken replies
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: default_assistant_name(),
            creator: default_creator(),
            repository: default_repository(),
            language: default_language(),
        }
    }
}

fn default_assistant_name() -> String {
    "ArcadiaAI Assistant".to_string()
}

fn default_creator() -> String {
    "Mirko Yuri Donato".to_string()
}

fn default_repository() -> String {
    "https://github.com/Mirko-linux/ArcadiaAI-Assistant".to_string()
}

fn default_language() -> String {
    "it".to_string()
}

/// Local language model configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    /// Quality/size tier: full, balanced, light
    #[serde(default)]
    pub tier: ModelTier,

    /// Directory holding the model artifacts (defaults to `<data_dir>/models`)
    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    /// Unload model after N seconds of inactivity (0 = never unload).
    #[serde(default = "default_idle_unload_secs")]
    pub idle_unload_secs: u64,

    /// How often the idle check runs
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Maximum number of tokens generated per reply
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Generation timeout in seconds
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    /// Model context window in tokens
    #[serde(default = "default_context_length")]
    pub context_length: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            tier: ModelTier::default(),
            models_dir: None,
            idle_unload_secs: default_idle_unload_secs(),
            check_interval_secs: default_check_interval_secs(),
            max_new_tokens: default_max_new_tokens(),
            generation_timeout_secs: default_generation_timeout_secs(),
            context_length: default_context_length(),
        }
    }
}

fn default_idle_unload_secs() -> u64 {
    300
}

fn default_check_interval_secs() -> u64 {
    5
}

fn default_max_new_tokens() -> usize {
    128
}

fn default_generation_timeout_secs() -> u64 {
    30
}

fn default_context_length() -> usize {
    4096 // Phi-3-mini-4k
}

/// Directive parsing and chat prompt configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouterConfig {
    /// Character that marks a directive
    #[serde(default = "default_prefix")]
    pub prefix: char,

    /// History turns fed to the model
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    /// Terms that are never sent to the image generator
    #[serde(default)]
    pub denylist: Vec<String>,

    /// Results returned by `@cerca`
    #[serde(default = "default_search_results")]
    pub search_results: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            history_turns: default_history_turns(),
            denylist: vec![],
            search_results: default_search_results(),
        }
    }
}

fn default_prefix() -> char {
    '@'
}

fn default_history_turns() -> usize {
    6
}

fn default_search_results() -> usize {
    3
}

/// Wake phrase detection configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WakeWordConfig {
    /// Enable wake phrase detection (requires always-on listening)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Phrase that activates the session (matched case-insensitively)
    #[serde(default = "default_wake_phrase")]
    pub phrase: String,

    /// Seconds during which further matches are ignored after a detection
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: f32,

    /// Length of each recognized audio frame in seconds
    #[serde(default = "default_frame_secs")]
    pub frame_secs: f32,

    /// Consecutive device errors tolerated before the listener gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry backoff (doubled after each failure)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Whisper model used for phrase recognition: tiny, base, small
    #[serde(default = "default_whisper_model")]
    pub whisper_model: String,

    /// Frames quieter than this are not sent to the recognizer
    #[serde(default = "default_energy_threshold_db")]
    pub energy_threshold_db: f32,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            phrase: default_wake_phrase(),
            cooldown_secs: default_cooldown_secs(),
            frame_secs: default_frame_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            whisper_model: default_whisper_model(),
            energy_threshold_db: default_energy_threshold_db(),
        }
    }
}

fn default_wake_phrase() -> String {
    "ehi arcadia".to_string()
}

fn default_cooldown_secs() -> f32 {
    0.5
}

fn default_frame_secs() -> f32 {
    2.0
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_whisper_model() -> String {
    "base".to_string()
}

fn default_energy_threshold_db() -> f32 {
    -45.0
}

/// Spoken reply configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpeechConfig {
    /// Speak every reply produced by the session
    #[serde(default)]
    pub speak_replies: bool,

    /// TTS command; the text is passed as the last argument (empty = log only)
    #[serde(default = "default_tts_command")]
    pub command: Vec<String>,

    /// Spoken when a session starts (empty = silent)
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            speak_replies: false,
            command: default_tts_command(),
            greeting: default_greeting(),
        }
    }
}

fn default_greeting() -> String {
    "Ciao, come posso aiutarti?".to_string()
}

fn default_tts_command() -> Vec<String> {
    vec!["espeak".to_string(), "-v".to_string(), "it".to_string()]
}

/// External HTTP service configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServicesConfig {
    /// CES-Image generation endpoint
    #[serde(default = "default_image_api_url")]
    pub image_api_url: String,

    #[serde(default = "default_image_timeout")]
    pub image_timeout_secs: u64,

    /// DuckDuckGo instant answer endpoint
    #[serde(default = "default_search_url")]
    pub search_url: String,

    /// Weather endpoint (wttr.in compatible)
    #[serde(default = "default_weather_url")]
    pub weather_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            image_api_url: default_image_api_url(),
            image_timeout_secs: default_image_timeout(),
            search_url: default_search_url(),
            weather_url: default_weather_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_image_api_url() -> String {
    "https://arcadiaai.onrender.com/api/ces-image".to_string()
}

fn default_image_timeout() -> u64 {
    20
}

fn default_search_url() -> String {
    "https://api.duckduckgo.com/".to_string()
}

fn default_weather_url() -> String {
    "https://wttr.in".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

/// REST API server configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiConfig {
    /// Bind address (default: 127.0.0.1:5000 - localhost only)
    #[serde(default = "default_api_bind")]
    pub bind: String,

    /// API key hash (SHA-256) for authentication.
    /// Generate with: `arcadia api-key generate`
    #[serde(default)]
    pub api_key_hash: Option<String>,

    /// Enable Swagger UI at /swagger-ui/
    #[serde(default = "default_true")]
    pub swagger_ui: bool,

    /// Allowed CORS origins (empty = same-origin only)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Open the chat page in the browser when the wake phrase is heard
    #[serde(default = "default_true")]
    pub open_on_wake: bool,

    /// Page opened on wake (defaults to the API address)
    #[serde(default)]
    pub surface_url: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
            api_key_hash: None,
            swagger_ui: true,
            cors_origins: vec![],
            open_on_wake: true,
            surface_url: None,
        }
    }
}

impl ApiConfig {
    /// URL of the interaction surface opened on wake.
    pub fn surface_url(&self) -> String {
        self.surface_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind))
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("org", "arcadia", "arcadia")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the data directory path (for models)
    pub fn data_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("org", "arcadia", "arcadia")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Directory holding model artifacts.
    pub fn models_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.model.models_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::data_dir()?.join("models")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from an explicit path, creating it with defaults if absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let contents = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wake_word.phrase.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "wake_word phrase cannot be empty".into(),
            ));
        }

        if self.wake_word.cooldown_secs < 0.0 {
            return Err(ConfigError::ValidationError(
                "wake_word cooldown_secs cannot be negative".into(),
            ));
        }

        if self.wake_word.frame_secs <= 0.0 || self.wake_word.frame_secs > 30.0 {
            return Err(ConfigError::ValidationError(
                "wake_word frame_secs must be between 0 and 30 seconds".into(),
            ));
        }

        if self.router.prefix.is_whitespace() || self.router.prefix.is_alphanumeric() {
            return Err(ConfigError::ValidationError(
                "router prefix must be a symbol".into(),
            ));
        }

        if self.model.check_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "model check_interval_secs must be positive".into(),
            ));
        }

        if self.model.generation_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "model generation_timeout_secs must be positive".into(),
            ));
        }

        if self.model.max_new_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "model max_new_tokens must be positive".into(),
            ));
        }

        if self.model.max_new_tokens >= self.model.context_length {
            return Err(ConfigError::ValidationError(
                "model max_new_tokens must be smaller than context_length".into(),
            ));
        }

        // Validate whisper model name doesn't contain path traversal
        if self.wake_word.whisper_model.contains("..") || self.wake_word.whisper_model.contains('/')
        {
            return Err(ConfigError::ValidationError(
                "whisper model name contains invalid characters".into(),
            ));
        }

        if let Some(ref dir) = self.model.models_dir {
            if dir.components().any(|c| c == std::path::Component::ParentDir) {
                return Err(ConfigError::ValidationError(
                    "models_dir contains path traversal sequence (..)".into(),
                ));
            }
        }

        if self
            .speech
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(ConfigError::ValidationError(
                "speech command program cannot be blank".into(),
            ));
        }

        Ok(())
    }

    /// Save config to file
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    /// Save config to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create config directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }
}

/// Persistence for settings changed at runtime (e.g. by `@modello`).
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Config, ConfigError>;
    fn save(&self, config: &Config) -> Result<(), ConfigError>;
}

/// [`ConfigStore`] backed by the TOML config file.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store at the default config location.
    pub fn default_location() -> Result<Self, ConfigError> {
        Ok(Self::new(Config::config_path()?))
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<Config, ConfigError> {
        Config::load_from(&self.path)
    }

    fn save(&self, config: &Config) -> Result<(), ConfigError> {
        config.validate()?;
        config.save_to(&self.path)
    }
}

/// Save `tier` as the model tier, off the async runtime.
pub async fn persist_model_tier(
    store: Arc<dyn ConfigStore>,
    tier: ModelTier,
) -> Result<(), ConfigError> {
    tokio::task::spawn_blocking(move || {
        let mut config = store.load()?;
        config.model.tier = tier;
        store.save(&config)
    })
    .await
    .map_err(|e| ConfigError::ReadError(std::io::Error::other(e)))?
}

/// Show current configuration
pub fn show(path: &Path) -> anyhow::Result<()> {
    let config = Config::load_from(path)?;

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

/// Update configuration
pub fn update(
    path: &Path,
    model: Option<String>,
    wake_word: Option<bool>,
    cloud: Option<bool>,
) -> anyhow::Result<()> {
    let mut config = Config::load_from(path)?;
    let mut changed = false;

    if let Some(m) = model {
        config.model.tier = m
            .parse()
            .map_err(|e: String| anyhow::anyhow!("{} Use 'full', 'balanced' or 'light'.", e))?;
        changed = true;
    }

    if let Some(enabled) = wake_word {
        config.wake_word.enabled = enabled;
        changed = true;
    }

    if let Some(enabled) = cloud {
        config.use_cloud = enabled;
        changed = true;
    }

    if changed {
        config.validate()?;
        config.save_to(path)?;
        println!("Configuration updated.");
    } else {
        println!("No changes specified. Use --show to view current config.");
    }

    Ok(())
}
