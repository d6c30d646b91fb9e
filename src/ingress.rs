use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use crate::{
    crypto::decrypt_json,
    error::ApiError,
    pipeline::ingest_and_publish,
    types::{now, Agent, AppState, Channel, IncomingMessage, ServiceName},
};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn text_or_number(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn whatsapp_message(payload: &Value) -> Option<&Value> {
    payload.pointer("/entry/0/changes/0/value/messages/0")
}

fn telegram_message(payload: &Value) -> Option<&Value> {
    payload.get("message").filter(|message| message.is_object())
}

/// Maps the payload shapes we accept (plain JSON, WhatsApp Cloud API,
/// Telegram updates) onto one inbound message.
pub fn normalize_inbound(payload: &Value) -> Result<IncomingMessage, ApiError> {
    let whatsapp = whatsapp_message(payload);
    let telegram = telegram_message(payload);

    let customer_identifier = text_or_number(payload.get("from"))
        .or_else(|| text_or_number(payload.get("customer_id")))
        .or_else(|| text_or_number(whatsapp.and_then(|m| m.get("from"))))
        .or_else(|| text_or_number(telegram.and_then(|m| m.pointer("/from/id"))))
        .or_else(|| text_or_number(telegram.and_then(|m| m.pointer("/chat/id"))))
        .unwrap_or_else(|| format!("anonymous-{}", Uuid::new_v4()));

    let content = [
        payload.get("message"),
        payload.get("text"),
        whatsapp.and_then(|m| m.pointer("/text/body")),
        telegram.and_then(|m| m.get("text")),
    ]
    .into_iter()
    .flatten()
    .find_map(|value| value.as_str().map(str::trim).filter(|text| !text.is_empty()))
    .map(str::to_string)
    .ok_or_else(|| ApiError::invalid("message", "message content is required"))?;

    let channel = payload
        .get("channel")
        .and_then(Value::as_str)
        .and_then(|value| value.parse::<Channel>().ok())
        .unwrap_or(if whatsapp.is_some() {
            Channel::Whatsapp
        } else if telegram.is_some() {
            Channel::Telegram
        } else {
            Channel::Api
        });

    Ok(IncomingMessage {
        customer_identifier,
        content,
        channel,
        metadata: json!({
            "webhook_payload": payload,
            "received_at": now(),
        }),
    })
}

/// The WhatsApp app secret, when the agent has one configured.
async fn signing_secret(state: &AppState, agent: &Agent) -> Result<Option<String>, ApiError> {
    let Some(integration) = state
        .store
        .find_integration(agent.id, ServiceName::Whatsapp)
        .await?
        .filter(|integration| integration.is_active)
    else {
        return Ok(None);
    };
    let credentials = decrypt_json(state.cipher.as_ref(), &integration.credentials)
        .map_err(|err| ApiError::internal("WEBHOOK_PROCESSING_ERROR", err))?;
    Ok(credentials
        .get("app_secret")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|secret| !secret.is_empty()))
}

/// `GET /webhook/ingress/{path}`: provider subscription handshake.
pub async fn verify_subscription(
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or_default();
    let verify_token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or_default();
    if mode != "subscribe" || verify_token != path {
        return Err(ApiError::forbidden(
            "VERIFICATION_FAILED",
            "Webhook verification failed",
        ));
    }
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    Ok((StatusCode::OK, challenge).into_response())
}

/// `POST /webhook/ingress/{path}`: inbound customer message from an
/// external service.
pub async fn receive_event(
    Path(path): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state
        .store
        .find_agent_by_ingress_path(&path)
        .await?
        .filter(|agent| agent.is_active)
        .ok_or_else(|| ApiError::not_found("WEBHOOK_NOT_FOUND", "Webhook not found"))?;

    if let Some(secret) = signing_secret(&state, &agent).await? {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if !verify_signature(&secret, signature, &body) {
            tracing::warn!(agent_id = %agent.id, "ingress webhook signature mismatch");
            return Err(ApiError::unauthorized(
                "INVALID_SIGNATURE",
                "Invalid webhook signature",
            ));
        }
    }

    let payload = serde_json::from_slice::<Value>(&body)
        .map_err(|err| ApiError::invalid("body", format!("invalid JSON: {err}")))?;
    let incoming = normalize_inbound(&payload)?;

    let ingested = ingest_and_publish(&state, agent.id, incoming)
        .await
        .map_err(|err| ApiError::internal("WEBHOOK_PROCESSING_ERROR", err))?;

    Ok(Json(json!({
        "success": true,
        "conversation_id": ingested.conversation.id,
        "message": "Message processed",
    })))
}
