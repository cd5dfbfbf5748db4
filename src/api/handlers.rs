//! API request handlers.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::Html,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::state::ApiState;
use crate::config::persist_model_tier;
use crate::engine::ModelTier;
use crate::lifecycle::{ModelStatus, UnloadOutcome};
use crate::router::{Attachment, Turn, Utterance};
use crate::services::TranscribeError;
use crate::session::SessionStatus;

/// Chat page served at `/`.
const INDEX_HTML: &str = include_str!("../../assets/index.html");

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Always "ok" if server is responding
    pub status: String,
    /// API version
    pub version: String,
}

/// Assistant status response.
#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub version: String,
    /// Language model lifecycle state
    #[schema(value_type = Object)]
    pub model: ModelStatus,
    /// Session and wake detection state
    #[schema(value_type = Object)]
    pub session: SessionStatus,
}

/// Generic success response.
#[derive(Debug, Serialize, ToSchema)]
pub struct SuccessResponse {
    /// Whether the operation changed anything
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Always false for errors
    pub ok: bool,
    pub error: String,
}

/// One chat turn from the client.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatRequest {
    /// User message; `@name argument` runs a command
    pub message: String,
    /// Earlier turns, oldest first
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub history: Vec<Turn>,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChatResponse {
    /// Reply text; generated images are `__IMAGE__:<url>`
    pub reply: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TranscribeRequest {
    /// WAV audio as base64 or a `data:audio/wav;base64,` URL
    pub audio: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TranscribeResponse {
    pub text: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ModelRequest {
    /// full/completa, balanced/bilanciata or light/leggera
    pub tier: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ModelResponse {
    pub tier: String,
    /// Another tier is loaded and stays until unloaded or evicted
    pub reload_required: bool,
    /// Whether the choice was written to the config file
    pub persisted: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UnloadResponse {
    /// unloaded, not_loaded or busy
    #[schema(value_type = String)]
    pub outcome: UnloadOutcome,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            ok: false,
            error: error.into(),
        }),
    )
}

fn bad_request(rejection: JsonRejection) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, rejection.body_text())
}

/// Chat page.
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Health check endpoint (no auth required).
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    ),
    tag = "Health"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Model and session status.
#[utoipa::path(
    get,
    path = "/api/v1/status",
    responses(
        (status = 200, description = "Current status", body = StatusResponse),
        (status = 401, description = "Unauthorized - missing or invalid API key")
    ),
    security(
        ("api_key" = [])
    ),
    tag = "Status"
)]
pub async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.models.status(),
        session: state.session.status(),
    })
}

/// Answer a chat message or command.
///
/// Model failures are answered in the reply text, never as HTTP errors.
#[utoipa::path(
    post,
    path = "/api/v1/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Assistant reply", body = ChatResponse),
        (status = 400, description = "Malformed request", body = ErrorResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("api_key" = [])
    ),
    tag = "Chat"
)]
pub async fn chat(
    State(state): State<ApiState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(request) = payload.map_err(bad_request)?;
    debug!(
        "Chat request: {} chars, {} history turns, {} attachments",
        request.message.len(),
        request.history.len(),
        request.attachments.len()
    );

    let utterance = Utterance::new(request.message)
        .with_history(request.history)
        .with_attachments(request.attachments);
    let reply = state.session.handle_turn(utterance).await;

    Ok(Json(ChatResponse {
        reply: reply.render(),
    }))
}

/// Transcribe a recorded clip.
#[utoipa::path(
    post,
    path = "/api/v1/transcribe",
    request_body = TranscribeRequest,
    responses(
        (status = 200, description = "Transcribed text", body = TranscribeResponse),
        (status = 400, description = "Malformed request or audio", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 500, description = "Transcription failed", body = ErrorResponse),
        (status = 503, description = "Speech model not installed", body = ErrorResponse)
    ),
    security(
        ("api_key" = [])
    ),
    tag = "Speech"
)]
pub async fn transcribe(
    State(state): State<ApiState>,
    payload: Result<Json<TranscribeRequest>, JsonRejection>,
) -> Result<Json<TranscribeResponse>, ApiError> {
    let Json(request) = payload.map_err(bad_request)?;

    let text = state
        .transcriber
        .transcribe(request.audio.as_bytes())
        .await
        .map_err(|e| {
            let status = match e {
                TranscribeError::InvalidAudio(_) => StatusCode::BAD_REQUEST,
                TranscribeError::ModelMissing(_) => StatusCode::SERVICE_UNAVAILABLE,
                TranscribeError::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!("Transcription failed: {}", e);
            api_error(status, e.to_string())
        })?;

    Ok(Json(TranscribeResponse { text }))
}

/// Start a session as if the wake phrase had been heard.
#[utoipa::path(
    post,
    path = "/api/v1/wake",
    responses(
        (status = 200, description = "ok is false when a session was already active", body = SuccessResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("api_key" = [])
    ),
    tag = "Session"
)]
pub async fn wake(State(state): State<ApiState>) -> Json<SuccessResponse> {
    let activated = state.session.activate();
    Json(SuccessResponse {
        ok: activated,
        message: Some(
            if activated {
                "Session started"
            } else {
                "Session already active"
            }
            .to_string(),
        ),
    })
}

/// End the active session.
#[utoipa::path(
    post,
    path = "/api/v1/session/end",
    responses(
        (status = 200, description = "ok is false when no session was active", body = SuccessResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("api_key" = [])
    ),
    tag = "Session"
)]
pub async fn end_session(State(state): State<ApiState>) -> Json<SuccessResponse> {
    let ended = state.session.end_session();
    Json(SuccessResponse {
        ok: ended,
        message: Some(if ended { "Session ended" } else { "No active session" }.to_string()),
    })
}

/// Choose the model tier for the next load.
#[utoipa::path(
    post,
    path = "/api/v1/model",
    request_body = ModelRequest,
    responses(
        (status = 200, description = "Tier selected", body = ModelResponse),
        (status = 400, description = "Unknown tier", body = ErrorResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("api_key" = [])
    ),
    tag = "Model"
)]
pub async fn set_model(
    State(state): State<ApiState>,
    payload: Result<Json<ModelRequest>, JsonRejection>,
) -> Result<Json<ModelResponse>, ApiError> {
    let Json(request) = payload.map_err(bad_request)?;
    let tier: ModelTier = request
        .tier
        .parse()
        .map_err(|e: String| api_error(StatusCode::BAD_REQUEST, e))?;

    let outcome = state.models.configure(tier);

    let persisted = match persist_model_tier(state.config_store.clone(), tier).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Model tier {} selected but not saved: {}", tier, e);
            false
        }
    };

    Ok(Json(ModelResponse {
        tier: tier.name().to_string(),
        reload_required: outcome.reload_required,
        persisted,
    }))
}

/// Unload the language model to free memory.
#[utoipa::path(
    post,
    path = "/api/v1/model/unload",
    responses(
        (status = 200, description = "Unload outcome", body = UnloadResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("api_key" = [])
    ),
    tag = "Model"
)]
pub async fn unload_model(State(state): State<ApiState>) -> Json<UnloadResponse> {
    Json(UnloadResponse {
        outcome: state.models.unload(),
    })
}
