//! REST API and chat page.
//!
//! The chat page at `/` is what the session opens on wake. Everything under
//! `/api/v1` except the health check requires the API key when one is
//! configured.
//!
//! ```toml
//! [api]
//! bind = "127.0.0.1:5000"
//! swagger_ui = true
//! ```
//!
//! Generate an API key:
//! ```bash
//! arcadia api-key generate
//! ```

mod auth;
mod handlers;
mod routes;
pub mod state;

pub use auth::{generate_api_key, hash_api_key};
pub use routes::create_router;
pub use state::ApiState;

use crate::config::ApiConfig;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Serve the API until `shutdown` flips to true.
pub async fn serve(
    state: ApiState,
    config: &ApiConfig,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid API bind address '{}': {}", config.bind, e))?;

    let router = create_router(state, config);

    let listener = TcpListener::bind(addr).await?;
    info!("Chat page at http://{}/", addr);
    if config.swagger_ui {
        info!("Swagger UI available at http://{}/swagger-ui/", addr);
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| {
            error!("API server error: {}", e);
            anyhow::anyhow!("API server error: {}", e)
        })
}
