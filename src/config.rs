use std::{env, path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("ENCRYPTION_KEY must be set in production")]
    MissingEncryptionKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub timeout: Duration,
    pub retry_base: Duration,
    pub max_retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry_base: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub store_backend: StoreBackend,
    pub api_base_url: String,
    pub upload_dir: PathBuf,
    pub encryption_key: String,
    pub app_env: String,
    pub reply_timeout: Duration,
    pub bcrypt_cost: u32,
    /// Lifetime of the bearer tokens issued at register/login.
    pub auth_token_ttl: Duration,
    /// Puts the detail string of 500 responses into the body.
    pub expose_internal_details: bool,
    pub webhook: WebhookConfig,
    pub openai: Option<OpenAiConfig>,
}

const DEV_ENCRYPTION_KEY: &str = "support-desk-development-key";

fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

pub fn resolve_database_url() -> String {
    if let Some(url) = var("DATABASE_URL") {
        return url;
    }
    let pick = |primary: &str, fallback: &str, default: &str| {
        var(primary)
            .or_else(|| var(fallback))
            .unwrap_or_else(|| default.to_string())
    };
    let host = pick("POSTGRES_HOST", "PGHOST", "localhost");
    let port = pick("POSTGRES_PORT", "PGPORT", "5432");
    let user = pick("POSTGRES_USER", "PGUSER", "postgres");
    let password = pick("POSTGRES_PASSWORD", "PGPASSWORD", "postgres");
    let db = pick("POSTGRES_DB", "PGDATABASE", "support_desk");
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_var("PORT", 4000u16)?;
        let app_env = var("APP_ENV").unwrap_or_else(|| "development".to_string());
        let store_backend = match var("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "STORE_BACKEND",
                    value: other.to_string(),
                })
            }
        };
        let encryption_key = match var("ENCRYPTION_KEY") {
            Some(key) => key,
            None if app_env == "production" => return Err(ConfigError::MissingEncryptionKey),
            None => {
                tracing::warn!("ENCRYPTION_KEY not set, using the development key");
                DEV_ENCRYPTION_KEY.to_string()
            }
        };
        let openai = var("OPENAI_API_KEY").map(|api_key| OpenAiConfig {
            api_key,
            model: var("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: var("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
        });

        Ok(Self {
            port,
            database_url: resolve_database_url(),
            store_backend,
            api_base_url: var("API_BASE_URL")
                .unwrap_or_else(|| format!("http://localhost:{port}"))
                .trim_end_matches('/')
                .to_string(),
            upload_dir: var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./uploads")),
            encryption_key,
            app_env,
            reply_timeout: Duration::from_millis(parse_var("REPLY_TIMEOUT_MS", 15_000u64)?),
            bcrypt_cost: parse_var("BCRYPT_COST", bcrypt::DEFAULT_COST)?,
            auth_token_ttl: Duration::from_secs(
                parse_var("AUTH_TOKEN_TTL_HOURS", 168u64)?.saturating_mul(3600),
            ),
            expose_internal_details: parse_var("EXPOSE_ERROR_DETAILS", false)?,
            webhook: WebhookConfig {
                timeout: Duration::from_millis(parse_var("WEBHOOK_TIMEOUT_MS", 10_000u64)?),
                retry_base: Duration::from_millis(parse_var("WEBHOOK_RETRY_BASE_MS", 1_000u64)?),
                max_retries: parse_var("WEBHOOK_MAX_RETRIES", 3u32)?,
            },
            openai,
        })
    }

    /// Baseline used by tests and the in-memory backend.
    pub fn for_tests() -> Self {
        Self {
            port: 4000,
            database_url: String::new(),
            store_backend: StoreBackend::Memory,
            api_base_url: "http://localhost:4000".to_string(),
            upload_dir: env::temp_dir().join("support-desk-uploads"),
            encryption_key: DEV_ENCRYPTION_KEY.to_string(),
            app_env: "test".to_string(),
            reply_timeout: Duration::from_secs(2),
            bcrypt_cost: 4,
            auth_token_ttl: Duration::from_secs(168 * 3600),
            expose_internal_details: false,
            webhook: WebhookConfig {
                timeout: Duration::from_secs(2),
                retry_base: Duration::from_millis(5),
                max_retries: 3,
            },
            openai: None,
        }
    }

    pub fn ingress_webhook_url(&self, path: &str) -> String {
        format!("{}/webhook/ingress/{path}", self.api_base_url)
    }
}
