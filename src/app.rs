use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    middleware,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

use crate::{
    account, agents, auth,
    config::{Config, ConfigError, StoreBackend},
    conversations,
    crypto::XChaChaCipher,
    error::{attach_internal_details, ApiError},
    ingress, public_api, realtime,
    reply::{CannedReplyGenerator, OpenAiReplyGenerator, ReplyGenerator},
    storage::{
        content_type_from_extension, extension_of, LocalFileStorage, StorageError, PUBLIC_FOLDERS,
    },
    store::{MemoryStore, PgStore, Store},
    types::AppState,
};

/// Multipart uploads (avatars, knowledge files) are capped at 10 MiB.
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars): {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to run sqlx migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "environment": state.config.app_env,
        "timestamp": crate::types::now(),
    }))
}

async fn serve_upload(
    Path((folder, file_name)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let not_found = || ApiError::not_found("FILE_NOT_FOUND", "File not found");
    if !PUBLIC_FOLDERS.contains(&folder.as_str()) {
        return Err(not_found());
    }
    let bytes = match state.files.read(&folder, &file_name).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Err(not_found()),
        Err(StorageError::InvalidName(_)) => {
            return Err(ApiError::bad_request("INVALID_FILE_NAME", "Invalid file name"))
        }
        Err(err) => return Err(ApiError::internal("STORAGE_ERROR", err)),
    };

    let content_type = extension_of(&file_name)
        .map(|ext| content_type_from_extension(&ext))
        .unwrap_or("application/octet-stream");
    let mut response = Response::new(axum::body::Body::from(bytes));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    Ok(response)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/uploads/{folder}/{file_name}", get(serve_upload))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/me", get(auth::me))
        .route(
            "/api/account",
            get(account::get_account).put(account::update_account),
        )
        .route(
            "/api/account/profile-picture",
            post(account::upload_profile_picture),
        )
        .route("/api/account/password", post(account::change_password))
        .route(
            "/api/agents",
            get(agents::get_agent).put(agents::update_agent),
        )
        .route("/api/agents/avatar", post(agents::upload_avatar))
        .route(
            "/api/agents/regenerate-api-key",
            post(agents::regenerate_api_key),
        )
        .route(
            "/api/agents/knowledge",
            get(agents::list_knowledge_files).post(agents::upload_knowledge_file),
        )
        .route(
            "/api/agents/knowledge/{file_id}",
            delete(agents::delete_knowledge_file),
        )
        .route(
            "/api/agents/integrations",
            post(agents::connect_integration),
        )
        .route(
            "/api/agents/integrations/test-webhook",
            post(agents::test_webhook),
        )
        .route(
            "/api/conversations",
            get(conversations::list_conversations),
        )
        .route(
            "/api/conversations/{conversation_id}",
            patch(conversations::update_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(conversations::list_messages).post(conversations::send_message),
        )
        .route("/api/v1/messages", post(public_api::send_message))
        .route("/api/v1/agent", get(public_api::agent_info))
        .route("/api/v1/conversations", get(public_api::list_conversations))
        .route(
            "/webhook/ingress/{path}",
            get(ingress::verify_subscription).post(ingress::receive_event),
        )
        .route("/ws", get(realtime::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(middleware::from_fn_with_state(
            state.config.expose_internal_details,
            attach_internal_details,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn connect_store(config: &Config) -> Result<Arc<dyn Store>, StartupError> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&config.database_url)
                .await?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            Ok(Arc::new(PgStore::new(pool)))
        }
    }
}

fn reply_generator(config: &Config) -> Arc<dyn ReplyGenerator> {
    match &config.openai {
        Some(openai) => {
            tracing::info!(model = %openai.model, "replies generated by the chat completions API");
            Arc::new(OpenAiReplyGenerator::new(reqwest::Client::new(), openai.clone()))
        }
        None => Arc::new(CannedReplyGenerator::new()),
    }
}

pub async fn run() -> Result<(), StartupError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("support_desk=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .map_err(|source| StartupError::Io {
            context: format!(
                "failed to create upload directory {}",
                config.upload_dir.display()
            ),
            source,
        })?;

    let store = connect_store(&config).await?;
    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        reply_generator(&config),
        Arc::new(XChaChaCipher::from_secret(&config.encryption_key)),
        Arc::new(LocalFileStorage::new(config.upload_dir.clone())),
    ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Io {
            context: format!("failed to bind {addr}"),
            source,
        })?;

    tracing::info!(port = config.port, env = %config.app_env, "support desk listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|source| StartupError::Io {
            context: "server runtime failure".to_string(),
            source,
        })
}
