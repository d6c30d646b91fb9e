use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bcrypt::{hash, verify};
use chrono::TimeDelta;
use serde_json::json;

use crate::{
    agents::ensure_active_agent,
    crypto::generate_auth_token,
    error::ApiError,
    types::{now, Agent, AppState, LoginBody, RegisterBody, User},
    validation::ValidJson,
};

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub async fn user_from_token(state: &AppState, token: &str) -> Result<User, ApiError> {
    state
        .store
        .find_user_by_token(token, now())
        .await?
        .ok_or_else(|| ApiError::unauthorized("INVALID_TOKEN", "Invalid or expired token"))
}

/// Operator authenticated by an opaque bearer token.
pub struct CurrentUser(pub User);

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("MISSING_TOKEN", "Access token required"))?;
        user_from_token(state, &token).await.map(CurrentUser)
    }
}

/// Agent authenticated by its public API key. The key must belong to an
/// active agent of an active user; rotated keys stop matching immediately.
pub struct ApiKeyAgent {
    pub agent: Agent,
    pub api_key: String,
}

impl FromRequestParts<Arc<AppState>> for ApiKeyAgent {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let api_key = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("MISSING_API_KEY", "API key required"))?;
        let agent = state
            .store
            .find_agent_by_api_key(&api_key)
            .await?
            .ok_or_else(|| ApiError::unauthorized("INVALID_API_KEY", "Invalid API key"))?;
        Ok(ApiKeyAgent { agent, api_key })
    }
}

pub(crate) async fn hash_password(password: String, cost: u32) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || hash(password, cost))
        .await
        .map_err(|err| ApiError::internal("PASSWORD_HASH_FAILED", err))?
        .map_err(|err| ApiError::internal("PASSWORD_HASH_FAILED", err))
}

pub(crate) async fn verify_password(password: String, password_hash: String) -> bool {
    tokio::task::spawn_blocking(move || verify(password, &password_hash).unwrap_or(false))
        .await
        .unwrap_or(false)
}

/// Issues a bearer token valid for `AUTH_TOKEN_TTL_HOURS` and drops tokens
/// that have already expired.
async fn issue_token(state: &AppState, user: &User) -> Result<String, ApiError> {
    let issued_at = now();
    let ttl = TimeDelta::from_std(state.config.auth_token_ttl)
        .map_err(|err| ApiError::internal("TOKEN_ISSUE_FAILED", err))?;
    let token = generate_auth_token();
    state
        .store
        .insert_auth_token(&token, user.id, issued_at + ttl)
        .await?;

    let pruned = state.store.delete_expired_auth_tokens(issued_at).await?;
    if pruned > 0 {
        tracing::debug!(pruned, "expired auth tokens removed");
    }
    Ok(token)
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    ValidJson(body): ValidJson<RegisterBody>,
) -> Result<impl IntoResponse, ApiError> {
    let password_hash = hash_password(body.password, state.config.bcrypt_cost).await?;
    let user = User::new(&body.name, &body.email, password_hash);
    if !state.store.insert_user(&user).await? {
        return Err(ApiError::conflict(
            "EMAIL_IN_USE",
            "Email is already registered",
        ));
    }
    let token = issue_token(&state, &user).await?;
    let agent = ensure_active_agent(state.store.as_ref(), &user).await?;
    tracing::info!(user_id = %user.id, agent_id = %agent.id, "user registered");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "token": token, "user": user, "agent": agent })),
    ))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    ValidJson(body): ValidJson<LoginBody>,
) -> Result<impl IntoResponse, ApiError> {
    let invalid = || ApiError::unauthorized("INVALID_CREDENTIALS", "Invalid email or password");
    let user = state
        .store
        .find_user_by_email(&body.email)
        .await?
        .filter(|user| user.is_active)
        .ok_or_else(invalid)?;
    if !verify_password(body.password, user.password_hash.clone()).await {
        return Err(invalid());
    }
    let token = issue_token(&state, &user).await?;
    Ok(Json(json!({ "token": token, "user": user })))
}

pub async fn me(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let agent = ensure_active_agent(state.store.as_ref(), &user).await?;
    Ok(Json(json!({ "user": user, "agent": agent })))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::{
        app::test_support::{get_request, json_request, register_operator, send, test_app},
        types::now,
    };

    #[tokio::test]
    async fn register_then_login_then_me() {
        let (app, _state) = test_app();
        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/auth/register",
                None,
                json!({ "name": "Ana Souza", "email": "Ana@Example.com", "password": "secret1" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"]["email"], json!("ana@example.com"));
        assert!(body["user"].get("password_hash").is_none());
        assert_eq!(body["agent"]["name"], json!("Assistant for Ana Souza"));
        assert!(body["agent"]["public_api_key"]
            .as_str()
            .unwrap()
            .starts_with("sk_"));

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/auth/register",
                None,
                json!({ "name": "Ana Again", "email": "ana@example.com", "password": "secret1" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], json!("EMAIL_IN_USE"));

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({ "email": "ana@example.com", "password": "wrong-password" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], json!("INVALID_CREDENTIALS"));

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({ "email": "ANA@example.com", "password": "secret1" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["token"].as_str().unwrap().to_string();

        let (status, body) = send(&app, get_request("/api/auth/me", Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["name"], json!("Ana Souza"));
    }

    #[tokio::test]
    async fn missing_and_unknown_tokens_are_rejected() {
        let (app, _state) = test_app();
        let (status, body) = send(&app, get_request("/api/auth/me", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], json!("MISSING_TOKEN"));

        let (status, body) = send(&app, get_request("/api/auth/me", Some("nope"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], json!("INVALID_TOKEN"));
    }

    #[tokio::test]
    async fn invalid_registration_reports_field_details() {
        let (app, _state) = test_app();
        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/auth/register",
                None,
                json!({ "name": "A", "email": "bad", "password": "1" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));
        assert_eq!(body["details"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn tokens_expire_after_their_lifetime() {
        let (app, state) = test_app();
        let (token, _) = register_operator(&app, "lia@example.com").await;
        let (status, _) = send(&app, get_request("/api/auth/me", Some(&token))).await;
        assert_eq!(status, StatusCode::OK);

        let user = state
            .store
            .find_user_by_token(&token, now())
            .await
            .unwrap()
            .unwrap();
        let past = now() - chrono::Duration::minutes(1);
        state
            .store
            .insert_auth_token("tok_expired", user.id, past)
            .await
            .unwrap();
        let (status, body) = send(&app, get_request("/api/auth/me", Some("tok_expired"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], json!("INVALID_TOKEN"));

        let lifetime = chrono::Duration::hours(168);
        assert!(state
            .store
            .find_user_by_token(&token, now() + lifetime + chrono::Duration::minutes(1))
            .await
            .unwrap()
            .is_none());

        // Logging in again prunes the expired row.
        send(
            &app,
            json_request(
                "POST",
                "/api/auth/login",
                None,
                json!({ "email": "lia@example.com", "password": "secret1" }),
            ),
        )
        .await;
        assert_eq!(state.store.delete_expired_auth_tokens(now()).await.unwrap(), 0);
    }
}
