//! API router setup with Swagger UI and middleware.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::auth::require_api_key;
use super::handlers::{
    self, chat, end_session, get_status, health, index, set_model, transcribe, unload_model,
    wake, ChatRequest, ChatResponse, ErrorResponse, HealthResponse, ModelRequest, ModelResponse,
    StatusResponse, SuccessResponse, TranscribeRequest, TranscribeResponse, UnloadResponse,
};
use super::state::ApiState;
use crate::config::ApiConfig;

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "ArcadiaAI Assistant API",
        version = "1.0.0",
        description = "Chat, transcription and model control for the ArcadiaAI assistant",
        license(name = "MPL-2.0", url = "https://www.mozilla.org/MPL/2.0/"),
        contact(name = "ArcadiaAI", url = "https://github.com/Mirko-linux/ArcadiaAI-Assistant")
    ),
    paths(
        handlers::health,
        handlers::get_status,
        handlers::chat,
        handlers::transcribe,
        handlers::wake,
        handlers::end_session,
        handlers::set_model,
        handlers::unload_model,
    ),
    components(
        schemas(
            HealthResponse,
            StatusResponse,
            SuccessResponse,
            ErrorResponse,
            ChatRequest,
            ChatResponse,
            TranscribeRequest,
            TranscribeResponse,
            ModelRequest,
            ModelResponse,
            UnloadResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Status", description = "Model and session status"),
        (name = "Chat", description = "Messages and commands"),
        (name = "Speech", description = "Speech-to-text"),
        (name = "Session", description = "Session control"),
        (name = "Model", description = "Language model control"),
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

/// Add API key security scheme to OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_key",
                utoipa::openapi::security::SecurityScheme::ApiKey(
                    utoipa::openapi::security::ApiKey::Header(
                        utoipa::openapi::security::ApiKeyValue::new("X-API-Key"),
                    ),
                ),
            );
        }
    }
}

/// Create the API router with all routes and middleware.
pub fn create_router(state: ApiState, config: &ApiConfig) -> Router {
    // Public routes (no auth)
    let public_routes = Router::new()
        .route("/", get(index))
        .route("/api/v1/health", get(health));

    // Protected routes (require API key)
    let protected_routes = Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/chat", post(chat))
        .route("/api/v1/transcribe", post(transcribe))
        .route("/api/v1/wake", post(wake))
        .route("/api/v1/session/end", post(end_session))
        .route("/api/v1/model", post(set_model))
        .route("/api/v1/model/unload", post(unload_model))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let mut router = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state);

    if config.swagger_ui {
        router = router
            .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));
    }

    let cors = if config.cors_origins.is_empty() {
        // Same-origin only
        CorsLayer::new()
    } else if config.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    router.layer(cors).layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::hash_api_key;
    use crate::lifecycle::ModelLifecycleManager;
    use crate::router::tests::{fixture, Fixture, MemoryStore};
    use crate::services::{LogSpeaker, TranscribeError, Transcriber};
    use crate::session::{NoSurface, SessionCoordinator, SessionOptions};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct StubTranscriber;

    #[async_trait]
    impl Transcriber for StubTranscriber {
        async fn transcribe(&self, audio: &[u8]) -> Result<String, TranscribeError> {
            match audio {
                b"missing" => Err(TranscribeError::ModelMissing("ggml-base.bin".into())),
                b"" => Err(TranscribeError::InvalidAudio("empty".into())),
                _ => Ok("ehi arcadia".into()),
            }
        }
    }

    struct App {
        router: Router,
        models: ModelLifecycleManager,
        store: Arc<MemoryStore>,
        session: Arc<SessionCoordinator>,
    }

    fn app_with(api: ApiConfig) -> App {
        let Fixture {
            router,
            models,
            store,
            ..
        } = fixture();
        let session = Arc::new(SessionCoordinator::new(
            Arc::new(router),
            Arc::new(NoSurface),
            Arc::new(LogSpeaker),
            SessionOptions {
                speak_replies: false,
                greeting: String::new(),
            },
        ));
        let state = ApiState::new(
            session.clone(),
            models.clone(),
            Arc::new(StubTranscriber),
            store.clone(),
            api.api_key_hash.clone(),
        );
        App {
            router: create_router(state, &api),
            models,
            store,
            session,
        }
    }

    fn app() -> App {
        app_with(ApiConfig::default())
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // ===================
    // Public routes
    // ===================

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .router
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_index_page() {
        let response = app()
            .router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // ===================
    // Chat
    // ===================

    #[tokio::test]
    async fn test_chat_directive() {
        let response = app()
            .router
            .oneshot(post_json("/api/v1/chat", r#"{"message": "@meteo Roma"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["reply"], "Roma: ☀️ +21°C");
    }

    #[tokio::test]
    async fn test_chat_with_history() {
        let body = r#"{
            "message": "e domani?",
            "history": [
                {"role": "user", "content": "che tempo fa?"},
                {"role": "assistant", "content": "sole"}
            ]
        }"#;
        let response = app()
            .router
            .oneshot(post_json("/api/v1/chat", body))
            .await
            .unwrap();
        let reply = body_json(response).await["reply"].as_str().unwrap().to_string();
        assert!(reply.contains("che tempo fa?"));
        assert!(reply.contains("e domani?"));
    }

    #[tokio::test]
    async fn test_chat_image_sentinel() {
        let response = app()
            .router
            .oneshot(post_json("/api/v1/chat", r#"{"message": "@immagine un gatto"}"#))
            .await
            .unwrap();
        let reply = body_json(response).await["reply"].as_str().unwrap().to_string();
        assert!(reply.starts_with("__IMAGE__:"));
    }

    #[tokio::test]
    async fn test_chat_malformed_is_400() {
        let response = app()
            .router
            .oneshot(post_json("/api/v1/chat", r#"{"text": "ciao"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["ok"], false);
    }

    // ===================
    // Transcription
    // ===================

    #[tokio::test]
    async fn test_transcribe_ok() {
        let response = app()
            .router
            .oneshot(post_json("/api/v1/transcribe", r#"{"audio": "UklGRg=="}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["text"], "ehi arcadia");
    }

    #[tokio::test]
    async fn test_transcribe_error_statuses() {
        let a = app();
        let missing = a
            .router
            .clone()
            .oneshot(post_json("/api/v1/transcribe", r#"{"audio": "missing"}"#))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::SERVICE_UNAVAILABLE);

        let empty = a
            .router
            .oneshot(post_json("/api/v1/transcribe", r#"{"audio": ""}"#))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    }

    // ===================
    // Session and model control
    // ===================

    #[tokio::test]
    async fn test_wake_and_end_session() {
        let a = app();
        let first = a
            .router
            .clone()
            .oneshot(post_json("/api/v1/wake", ""))
            .await
            .unwrap();
        assert_eq!(body_json(first).await["ok"], true);
        assert!(a.session.is_active());

        let second = a
            .router
            .clone()
            .oneshot(post_json("/api/v1/wake", ""))
            .await
            .unwrap();
        assert_eq!(body_json(second).await["ok"], false);

        let end = a
            .router
            .oneshot(post_json("/api/v1/session/end", ""))
            .await
            .unwrap();
        assert_eq!(body_json(end).await["ok"], true);
        assert!(!a.session.is_active());
    }

    #[tokio::test]
    async fn test_set_model_persists() {
        let a = app();
        let response = a
            .router
            .clone()
            .oneshot(post_json("/api/v1/model", r#"{"tier": "leggera"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["tier"], "light");
        assert_eq!(json["persisted"], true);
        assert_eq!(a.store.saves.load(Ordering::SeqCst), 1);

        let bad = a
            .router
            .oneshot(post_json("/api/v1/model", r#"{"tier": "enorme"}"#))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unload_and_status() {
        let a = app();
        a.models.acquire().await.unwrap();

        let status = a
            .router
            .clone()
            .oneshot(Request::get("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(status).await;
        assert_eq!(json["model"]["state"], "loaded");
        assert_eq!(json["session"]["active"], false);

        let response = a
            .router
            .oneshot(post_json("/api/v1/model/unload", ""))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["outcome"], "unloaded");
    }

    // ===================
    // Authentication
    // ===================

    #[tokio::test]
    async fn test_api_key_required_when_configured() {
        let api = ApiConfig {
            api_key_hash: Some(hash_api_key("segreto")),
            ..ApiConfig::default()
        };
        let a = app_with(api);

        let health = a
            .router
            .clone()
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let denied = a
            .router
            .clone()
            .oneshot(post_json("/api/v1/chat", r#"{"message": "ciao"}"#))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut allowed = post_json("/api/v1/chat", r#"{"message": "@data"}"#);
        allowed
            .headers_mut()
            .insert("X-API-Key", "segreto".parse().unwrap());
        let allowed = a.router.oneshot(allowed).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }
}
