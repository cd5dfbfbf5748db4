use arcadia::config::{self, Config, ConfigStore, FileConfigStore, LoggingConfig};
use arcadia::engine::{download_artifact, Artifact, ModelTier, WhisperModel};
use arcadia::{api, daemon, panic_handler};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "arcadia")]
#[command(author, version, about = "ArcadiaAI voice and text assistant", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: platform config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the assistant: wake phrase listener, chat page and REST API
    Serve {
        /// Do not listen for the wake phrase
        #[arg(long)]
        no_wake: bool,
    },

    /// Send one message or command and print the reply
    Chat {
        /// Message, e.g. "@meteo Roma" or "ciao"
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },

    /// Configure settings
    Config {
        /// Set the model tier (full, balanced, light)
        #[arg(long)]
        model: Option<String>,

        /// Enable/disable wake phrase detection
        #[arg(long)]
        wake_word: Option<bool>,

        /// Enable/disable cloud back-ends
        #[arg(long)]
        cloud: Option<bool>,

        /// Show current configuration
        #[arg(long)]
        show: bool,
    },

    /// Manage model files
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },

    /// Manage the REST API key
    ApiKey {
        #[command(subcommand)]
        action: ApiKeyAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// List models and whether they are installed
    List,

    /// Download a model
    Download {
        /// full, balanced, light (language) or tiny, base, small (speech)
        name: String,
    },

    /// Print the models directory
    Path,
}

#[derive(Subcommand)]
enum ApiKeyAction {
    /// Generate a new key and store its hash in the config
    Generate,
}

fn init_logging(verbose: bool, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = || {
        if verbose {
            EnvFilter::new("arcadia=debug,tower_http=debug,whisper_rs=info")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(format!("arcadia={},whisper_rs=warn", logging.level))
            })
        }
    };

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file, guard) = match logging.file.then(Config::data_dir) {
        Some(Ok(dir)) => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), "arcadia.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry().with(stderr).with(file).init();
    guard
}

fn print_models(models_dir: &Path) {
    let mark = |path: PathBuf| if path.exists() { "installed" } else { "-" };

    println!("Language models ({}):", models_dir.display());
    for tier in ModelTier::ALL {
        let spec = tier.spec(models_dir);
        println!(
            "  {:<9} {:<11} {:<10} {}",
            tier.name(),
            tier.italian_name(),
            mark(spec.model_path),
            tier.description()
        );
    }

    println!("\nSpeech models:");
    for model in [WhisperModel::Tiny, WhisperModel::Base, WhisperModel::Small] {
        println!(
            "  {:<9} {}",
            model.name(),
            mark(models_dir.join(model.filename()))
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    panic_handler::install();
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };
    let config = Config::load_from(&config_path)?;
    let _log_guard = init_logging(cli.verbose, &config.logging);
    let store: Arc<dyn ConfigStore> = Arc::new(FileConfigStore::new(config_path.clone()));

    match cli.command {
        Commands::Serve { no_wake } => {
            info!("Starting {}...", config.assistant.name);
            daemon::serve(config, store, !no_wake).await?;
        }

        Commands::Chat { message } => {
            let reply = daemon::chat_once(config, store, &message.join(" ")).await?;
            println!("{}", reply);
        }

        Commands::Config {
            model,
            wake_word,
            cloud,
            show,
        } => {
            if show {
                config::show(&config_path)?;
            } else {
                config::update(&config_path, model, wake_word, cloud)?;
            }
        }

        Commands::Model { action } => {
            let models_dir = config.models_dir()?;
            match action {
                ModelAction::List => print_models(&models_dir),
                ModelAction::Path => println!("{}", models_dir.display()),
                ModelAction::Download { name } => {
                    let artifact: Artifact = name.parse().map_err(anyhow::Error::msg)?;
                    let fetched = download_artifact(artifact, &models_dir).await?;
                    if fetched.is_empty() {
                        println!("'{}' is already installed in {}", name, models_dir.display());
                    } else {
                        for path in fetched {
                            println!("Downloaded {}", path.display());
                        }
                    }
                }
            }
        }

        Commands::ApiKey { action } => match action {
            ApiKeyAction::Generate => {
                let key = api::generate_api_key();
                let mut config = store.load()?;
                config.api.api_key_hash = Some(api::hash_api_key(&key));
                store.save(&config)?;

                println!("API key: {}", key);
                println!("Only its hash was saved to {}.", config_path.display());
                println!("Send it as the X-API-Key header.");
            }
        },
    }

    Ok(())
}
