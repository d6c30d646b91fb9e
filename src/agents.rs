use std::sync::Arc;

use axum::{
    extract::{multipart::Multipart, FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::CurrentUser,
    crypto::{encrypt_json, generate_api_key},
    dispatch::spawn_detached,
    error::ApiError,
    storage::{extension_of, AVATAR_FOLDER, KNOWLEDGE_FOLDER},
    store::Store,
    types::{
        now, Agent, AppState, ConnectIntegrationBody, Integration, KnowledgeFile,
        KnowledgeFileType, UpdateAgentBody, User,
    },
    validation::ValidJson,
};

const AGENT_NAME_MAX_CHARS: usize = 100;
pub(crate) const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// Returns the user's active agent, creating `Assistant for <name>` on first
/// access. Two racing creators both end up with the row that won the insert.
pub async fn ensure_active_agent(store: &dyn Store, user: &User) -> Result<Agent, ApiError> {
    if let Some(agent) = store.find_active_agent_for_user(user.id).await? {
        return Ok(agent);
    }

    let name = format!("Assistant for {}", user.name)
        .chars()
        .take(AGENT_NAME_MAX_CHARS)
        .collect::<String>();
    let agent = Agent::new_for_user(user.id, name);
    if store.insert_agent(&agent).await? {
        tracing::info!(user_id = %user.id, agent_id = %agent.id, "agent created");
        return Ok(agent);
    }

    store
        .find_active_agent_for_user(user.id)
        .await?
        .ok_or_else(|| {
            ApiError::internal(
                "AGENT_CREATE_FAILED",
                format!("active agent for user {} vanished after insert conflict", user.id),
            )
        })
}

/// Authenticated operator together with their active agent.
pub struct Operator {
    pub user: User,
    pub agent: Agent,
}

impl FromRequestParts<Arc<AppState>> for Operator {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        let agent = ensure_active_agent(state.store.as_ref(), &user).await?;
        Ok(Operator { user, agent })
    }
}

pub fn integration_view(integration: &Integration) -> Value {
    json!({
        "id": integration.id,
        "service_name": integration.service_name,
        "is_active": integration.is_active,
        "connected_at": integration.connected_at,
        "has_credentials": !integration.credentials.is_empty(),
    })
}

fn knowledge_file_view(file: &KnowledgeFile) -> Value {
    json!({
        "id": file.id,
        "file_name": file.file_name,
        "file_type": file.file_type,
        "file_size": file.file_size,
        "uploaded_at": file.uploaded_at,
    })
}

fn agent_view(state: &AppState, agent: &Agent) -> Result<Value, ApiError> {
    let mut body =
        serde_json::to_value(agent).map_err(|err| ApiError::internal("INTERNAL_ERROR", err))?;
    if let Value::Object(map) = &mut body {
        map.insert(
            "ingress_webhook_url".to_string(),
            Value::String(state.config.ingress_webhook_url(&agent.ingress_webhook_path)),
        );
    }
    Ok(body)
}

/// Best-effort cleanup of a stored upload; the database row is the source of
/// truth, so a leftover file is logged and left behind.
pub(crate) async fn remove_stored_file(state: &AppState, url: &str) {
    if let Err(err) = state.files.delete(url).await {
        tracing::warn!(url, error = %err, "stored file not removed");
    }
}

pub(crate) struct UploadedFile {
    pub(crate) file_name: String,
    pub(crate) bytes: Vec<u8>,
}

/// Pulls the first non-empty part named `field` out of a multipart body.
pub(crate) async fn read_upload(
    mut multipart: Multipart,
    field: &str,
) -> Result<UploadedFile, ApiError> {
    while let Some(part) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request("UPLOAD_ERROR", err.body_text()))?
    {
        if part.name() != Some(field) {
            continue;
        }
        let file_name = part.file_name().unwrap_or_default().trim().to_string();
        let bytes = part
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request("UPLOAD_ERROR", err.body_text()))?;
        if bytes.is_empty() {
            continue;
        }
        return Ok(UploadedFile {
            file_name,
            bytes: bytes.to_vec(),
        });
    }
    Err(ApiError::bad_request("NO_FILE", "No file uploaded"))
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
) -> Result<impl IntoResponse, ApiError> {
    let files = state.store.list_knowledge_files(agent.id).await?;
    let integrations = state.store.list_integrations(agent.id).await?;

    let mut body = agent_view(&state, &agent)?;
    if let Value::Object(map) = &mut body {
        map.insert(
            "knowledge_files".to_string(),
            files.iter().map(knowledge_file_view).collect(),
        );
        map.insert(
            "integrations".to_string(),
            integrations.iter().map(integration_view).collect(),
        );
    }
    Ok(Json(json!({ "success": true, "agent": body })))
}

fn agent_gone(agent_id: Uuid) -> ApiError {
    ApiError::not_found("AGENT_NOT_FOUND", format!("Agent {agent_id} not found"))
}

pub async fn update_agent(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
    ValidJson(update): ValidJson<UpdateAgentBody>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state
        .store
        .update_agent(agent.id, &update, now())
        .await?
        .ok_or_else(|| agent_gone(agent.id))?;
    tracing::info!(agent_id = %agent.id, "agent settings updated");

    Ok(Json(json!({
        "success": true,
        "message": "Agent settings updated",
        "agent": agent_view(&state, &agent)?,
    })))
}

pub async fn upload_avatar(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let upload = read_upload(multipart, "avatar").await?;
    let is_image = extension_of(&upload.file_name)
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()));
    if !is_image {
        return Err(ApiError::bad_request(
            "INVALID_FILE_TYPE",
            "Avatar must be a jpg, png, gif or webp image",
        ));
    }

    let stored = state
        .files
        .save(AVATAR_FOLDER, &upload.file_name, &upload.bytes)
        .await
        .map_err(|err| ApiError::internal("UPLOAD_ERROR", err))?;

    let previous = state
        .store
        .replace_agent_avatar(agent.id, &stored.url, now())
        .await?;
    if let Some(old) = previous.filter(|old| *old != stored.url) {
        remove_stored_file(&state, &old).await;
    }

    Ok(Json(json!({
        "success": true,
        "message": "Agent avatar updated",
        "avatar_url": stored.url,
    })))
}

pub async fn regenerate_api_key(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
) -> Result<impl IntoResponse, ApiError> {
    let api_key = generate_api_key();
    if !state.store.rotate_api_key(agent.id, &api_key, now()).await? {
        return Err(agent_gone(agent.id));
    }
    tracing::info!(agent_id = %agent.id, "public api key rotated");

    Ok(Json(json!({
        "success": true,
        "message": "New API key generated",
        "public_api_key": api_key,
    })))
}

pub async fn list_knowledge_files(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
) -> Result<impl IntoResponse, ApiError> {
    let files = state.store.list_knowledge_files(agent.id).await?;
    Ok(Json(json!({
        "success": true,
        "files": files.iter().map(knowledge_file_view).collect::<Vec<_>>(),
    })))
}

pub async fn upload_knowledge_file(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let upload = read_upload(multipart, "file").await?;
    let file_type = extension_of(&upload.file_name)
        .and_then(|ext| ext.parse::<KnowledgeFileType>().ok())
        .ok_or_else(|| {
            ApiError::bad_request(
                "INVALID_FILE_TYPE",
                "Knowledge files must be pdf, txt, doc or docx",
            )
        })?;

    let stored = state
        .files
        .save(KNOWLEDGE_FOLDER, &upload.file_name, &upload.bytes)
        .await
        .map_err(|err| ApiError::internal("UPLOAD_ERROR", err))?;
    tracing::debug!(agent_id = %agent.id, stored = %stored.stored_name, "knowledge file stored");

    let file = KnowledgeFile {
        id: Uuid::new_v4(),
        agent_id: agent.id,
        file_name: upload.file_name,
        file_url: stored.url,
        file_type,
        file_size: stored.size,
        uploaded_at: now(),
    };
    if let Err(err) = state.store.insert_knowledge_file(&file).await {
        remove_stored_file(&state, &file.file_url).await;
        return Err(err.into());
    }
    tracing::info!(agent_id = %agent.id, file_id = %file.id, size = file.file_size, "knowledge file added");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "File added to the knowledge base",
            "file": knowledge_file_view(&file),
        })),
    ))
}

pub async fn delete_knowledge_file(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
    Path(file_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let not_found = || ApiError::not_found("FILE_NOT_FOUND", "File not found");
    let file = state
        .store
        .find_knowledge_file(agent.id, file_id)
        .await?
        .ok_or_else(not_found)?;

    remove_stored_file(&state, &file.file_url).await;
    if !state.store.delete_knowledge_file(agent.id, file.id).await? {
        return Err(not_found());
    }

    Ok(Json(json!({
        "success": true,
        "message": "File removed from the knowledge base",
    })))
}

pub async fn connect_integration(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
    ValidJson(request): ValidJson<ConnectIntegrationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ciphertext = encrypt_json(state.cipher.as_ref(), &request.credentials)
        .map_err(|err| ApiError::internal("INTEGRATION_ERROR", err))?;
    let connected_at = now();
    let integration = state
        .store
        .upsert_integration(&Integration {
            id: Uuid::new_v4(),
            agent_id: agent.id,
            service_name: request.service,
            credentials: ciphertext,
            is_active: true,
            connected_at,
            updated_at: connected_at,
        })
        .await?;
    tracing::info!(agent_id = %agent.id, service = %request.service, "integration connected");

    let webhooks = state.webhooks.clone();
    let ingress_url = state.config.ingress_webhook_url(&agent.ingress_webhook_path);
    let verify_token = agent.ingress_webhook_path.clone();
    let service = request.service;
    let credentials = request.credentials;
    spawn_detached("configure_provider", async move {
        if let Some(outcome) = webhooks
            .configure_provider(service, &credentials, &ingress_url, &verify_token)
            .await?
        {
            tracing::info!(%service, %outcome, "provider webhook configured");
        }
        Ok::<(), crate::webhook::WebhookError>(())
    });

    Ok(Json(json!({
        "success": true,
        "message": format!("{} connected", request.service),
        "integration": integration_view(&integration),
    })))
}

pub async fn test_webhook(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
) -> Result<impl IntoResponse, ApiError> {
    let url = agent.outbound_webhook_url.ok_or_else(|| {
        ApiError::bad_request("WEBHOOK_NOT_CONFIGURED", "Outbound webhook URL is not configured")
    })?;
    let result = state.webhooks.test_connection(&url).await;
    Ok(Json(json!({
        "success": result["success"],
        "message": result["message"],
        "details": result,
    })))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        app::test_support::{
            get_request, json_request, multipart_request, register_operator, send, test_app,
        },
        crypto::decrypt_json,
        types::ServiceName,
    };

    #[tokio::test]
    async fn lazy_creation_converges_on_one_agent() {
        let (_app, state) = test_app();
        let user = User::new("Bia", "bia@example.com", "hash".into());
        assert!(state.store.insert_user(&user).await.unwrap());

        let handles = (0..8)
            .map(|_| {
                let state = state.clone();
                let user = user.clone();
                tokio::spawn(async move { ensure_active_agent(state.store.as_ref(), &user).await })
            })
            .collect::<Vec<_>>();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        let agent = state.store.find_active_agent_for_user(user.id).await.unwrap().unwrap();
        assert_eq!(agent.name, "Assistant for Bia");
    }

    #[tokio::test]
    async fn agent_view_hides_credentials_and_builds_ingress_url() {
        let (app, _state) = test_app();
        let (token, agent) = register_operator(&app, "carla@example.com").await;

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                "/api/agents/integrations",
                Some(&token),
                json!({ "service": "twilio", "credentials": { "account_sid": "AC1", "auth_token": "t0k" } }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, get_request("/api/agents", Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        let path = agent["ingress_webhook_path"].as_str().unwrap();
        assert_eq!(
            body["agent"]["ingress_webhook_url"],
            json!(format!("http://localhost:4000/webhook/ingress/{path}"))
        );
        let integration = &body["agent"]["integrations"][0];
        assert_eq!(integration["service_name"], json!("twilio"));
        assert_eq!(integration["has_credentials"], json!(true));
        assert!(integration.get("credentials").is_none());
        assert!(!body.to_string().contains("t0k"));
    }

    #[tokio::test]
    async fn integration_credentials_are_encrypted_and_upserted() {
        let (app, state) = test_app();
        let (token, agent) = register_operator(&app, "dora@example.com").await;
        let agent_id: Uuid = serde_json::from_value(agent["id"].clone()).unwrap();

        for sid in ["AC1", "AC2"] {
            let (status, _) = send(
                &app,
                json_request(
                    "POST",
                    "/api/agents/integrations",
                    Some(&token),
                    json!({ "service": "twilio", "credentials": { "account_sid": sid, "auth_token": "x" } }),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        assert_eq!(state.store.list_integrations(agent_id).await.unwrap().len(), 1);
        let stored = state
            .store
            .find_integration(agent_id, ServiceName::Twilio)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.credentials.starts_with("v1:"));
        let plain = decrypt_json(state.cipher.as_ref(), &stored.credentials).unwrap();
        assert_eq!(plain["account_sid"], json!("AC2"));

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/agents/integrations",
                Some(&token),
                json!({ "service": "telegram", "credentials": {} }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn update_clears_webhook_url_with_empty_string() {
        let (app, _state) = test_app();
        let (token, _) = register_operator(&app, "eva@example.com").await;

        let (status, body) = send(
            &app,
            json_request(
                "PUT",
                "/api/agents",
                Some(&token),
                json!({ "tone": "empathetic", "outbound_webhook_url": "https://hooks.example.com/in" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agent"]["tone"], json!("empathetic"));
        assert_eq!(body["agent"]["outbound_webhook_url"], json!("https://hooks.example.com/in"));

        let (_, body) = send(
            &app,
            json_request("PUT", "/api/agents", Some(&token), json!({ "outbound_webhook_url": "" })),
        )
        .await;
        assert_eq!(body["agent"]["outbound_webhook_url"], Value::Null);

        let (status, body) = send(
            &app,
            json_request("POST", "/api/agents/integrations/test-webhook", Some(&token), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("WEBHOOK_NOT_CONFIGURED"));
    }

    #[tokio::test]
    async fn knowledge_files_upload_list_and_delete() {
        let (app, _state) = test_app();
        let (token, _) = register_operator(&app, "fabi@example.com").await;

        let (status, body) = send(
            &app,
            multipart_request("/api/agents/knowledge", &token, "file", "faq.txt", b"Opening hours: 9-18"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["file"]["file_type"], json!("txt"));
        assert_eq!(body["file"]["file_size"], json!(19));
        let file_id = body["file"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            multipart_request("/api/agents/knowledge", &token, "file", "run.exe", b"MZ"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("INVALID_FILE_TYPE"));

        let (_, body) = send(&app, get_request("/api/agents/knowledge", Some(&token))).await;
        assert_eq!(body["files"].as_array().unwrap().len(), 1);

        let uri = format!("/api/agents/knowledge/{file_id}");
        let (status, _) = send(&app, json_request("DELETE", &uri, Some(&token), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, json_request("DELETE", &uri, Some(&token), json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("FILE_NOT_FOUND"));
    }

    #[tokio::test]
    async fn failed_file_cleanup_does_not_block_deletion() {
        let (app, state) = test_app();
        let (token, agent) = register_operator(&app, "hana@example.com").await;
        let agent_id: Uuid = serde_json::from_value(agent["id"].clone()).unwrap();
        let file = KnowledgeFile {
            id: Uuid::new_v4(),
            agent_id,
            file_name: "faq.txt".to_string(),
            file_url: "/uploads/knowledge/../outside.txt".to_string(),
            file_type: KnowledgeFileType::Txt,
            file_size: 3,
            uploaded_at: now(),
        };
        state.store.insert_knowledge_file(&file).await.unwrap();

        let uri = format!("/api/agents/knowledge/{}", file.id);
        let (status, _) = send(&app, json_request("DELETE", &uri, Some(&token), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state
            .store
            .find_knowledge_file(agent_id, file.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn avatar_upload_replaces_the_previous_file() {
        let (app, _state) = test_app();
        let (token, _) = register_operator(&app, "gabi@example.com").await;

        let (status, first) = send(
            &app,
            multipart_request("/api/agents/avatar", &token, "avatar", "me.png", b"\x89PNG first"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let first_url = first["avatar_url"].as_str().unwrap().to_string();
        assert!(first_url.starts_with("/uploads/avatars/"));

        let (status, _) = send(
            &app,
            multipart_request("/api/agents/avatar", &token, "avatar", "me.png", b"\x89PNG second"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, get_request(&first_url, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            multipart_request("/api/agents/avatar", &token, "avatar", "notes.txt", b"text"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("INVALID_FILE_TYPE"));
    }
}
