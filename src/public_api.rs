use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::{
    auth::ApiKeyAgent,
    conversations::page_bounds,
    error::ApiError,
    pipeline::ingest_and_publish,
    types::{now, AppState, Channel, ConversationFilter, IncomingMessage, PageQuery, PublicMessageBody},
    validation::ValidJson,
};

const DEFAULT_CUSTOMER: &str = "API User";
const KEY_PREVIEW_CHARS: usize = 10;

fn key_preview(api_key: &str) -> String {
    let prefix = api_key.chars().take(KEY_PREVIEW_CHARS).collect::<String>();
    format!("{prefix}...")
}

/// `POST /api/v1/messages`: send a customer message as the key's agent.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    ApiKeyAgent { agent, api_key }: ApiKeyAgent,
    ValidJson(body): ValidJson<PublicMessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let incoming = IncomingMessage {
        customer_identifier: body
            .customer_identifier
            .unwrap_or_else(|| DEFAULT_CUSTOMER.to_string()),
        content: body.message,
        channel: body.channel,
        metadata: json!({
            "api_request": true,
            "api_key": key_preview(&api_key),
            "timestamp": now(),
        }),
    };
    let ingested = ingest_and_publish(&state, agent.id, incoming).await?;
    let customer = &ingested.customer_message;
    let reply = &ingested.reply_message;

    Ok(Json(json!({
        "success": true,
        "conversation_id": ingested.conversation.id,
        "customer_message": {
            "id": customer.id,
            "content": customer.content,
            "timestamp": customer.created_at,
        },
        "ai_response": {
            "id": reply.id,
            "content": reply.content,
            "confidence": reply.metadata.get("confidence").cloned().unwrap_or(Value::Null),
            "processing_time_ms": reply.metadata.get("processing_time").cloned().unwrap_or(Value::Null),
            "timestamp": reply.created_at,
        },
    })))
}

pub async fn agent_info(ApiKeyAgent { agent, .. }: ApiKeyAgent) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "agent": {
            "id": agent.id,
            "name": agent.name,
            "language": agent.persona.language,
            "is_active": agent.is_active,
        },
    }))
}

/// Conversations opened through the public API, most recent first.
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    ApiKeyAgent { agent, .. }: ApiKeyAgent,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = page_bounds(query.limit, query.offset, 10);
    let filter = ConversationFilter {
        channel: Some(Channel::Api),
        limit,
        offset,
        ..ConversationFilter::default()
    };
    let page = state.store.list_conversations(agent.id, &filter).await?;
    let conversations = page
        .items
        .iter()
        .map(|summary| {
            let conversation = &summary.conversation;
            json!({
                "id": conversation.id,
                "customer_identifier": conversation.customer_identifier,
                "status": conversation.status,
                "last_activity_at": conversation.last_activity_at,
                "created_at": conversation.created_at,
            })
        })
        .collect::<Vec<_>>();

    Ok(Json(json!({
        "success": true,
        "conversations": conversations,
        "pagination": page.pagination(limit, offset),
    })))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::app::test_support::{get_request, json_request, register_operator, send, test_app};

    #[test]
    fn key_preview_keeps_ten_characters() {
        assert_eq!(key_preview("sk_0123456789abcdef"), "sk_0123456...");
    }

    #[tokio::test]
    async fn api_key_send_creates_an_api_conversation() {
        let (app, state) = test_app();
        let (_, agent) = register_operator(&app, "mara@example.com").await;
        let key = agent["public_api_key"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            json_request("POST", "/api/v1/messages", Some(&key), json!({ "message": "Olá, preciso de ajuda?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert!(body["ai_response"]["confidence"].as_f64().unwrap() > 0.0);
        assert!(body["ai_response"]["processing_time_ms"].is_u64());

        let conversation_id = serde_json::from_value(body["conversation_id"].clone()).unwrap();
        let agent_id = serde_json::from_value(agent["id"].clone()).unwrap();
        let conversation = state
            .store
            .find_conversation(agent_id, conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.customer_identifier, "API User");
        assert_eq!(conversation.channel, Channel::Api);
        let messages = state.store.list_messages(conversation_id, 10, 0).await.unwrap();
        assert_eq!(messages.items[0].metadata["api_key"], json!(key_preview(&key)));

        let (status, body) = send(&app, get_request("/api/v1/conversations", Some(&key))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conversations"].as_array().unwrap().len(), 1);

        let (_, body) = send(&app, get_request("/api/v1/agent", Some(&key))).await;
        assert_eq!(body["agent"]["language"], json!("pt"));
    }

    #[tokio::test]
    async fn rotated_key_is_rejected_immediately() {
        let (app, _state) = test_app();
        let (token, agent) = register_operator(&app, "nina@example.com").await;
        let old_key = agent["public_api_key"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            json_request("POST", "/api/agents/regenerate-api-key", Some(&token), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let new_key = body["public_api_key"].as_str().unwrap().to_string();
        assert_ne!(new_key, old_key);

        let (status, body) = send(&app, get_request("/api/v1/agent", Some(&old_key))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], json!("INVALID_API_KEY"));

        let (status, _) = send(
            &app,
            json_request("PUT", "/api/agents", Some(&token), json!({ "name": "Renamed bot" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, get_request("/api/v1/agent", Some(&old_key))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&app, get_request("/api/v1/agent", Some(&new_key))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agent"]["name"], json!("Renamed bot"));
    }

    #[tokio::test]
    async fn missing_key_and_bad_bodies_are_rejected() {
        let (app, _state) = test_app();
        let (_, agent) = register_operator(&app, "olga@example.com").await;
        let key = agent["public_api_key"].as_str().unwrap().to_string();

        let (status, body) = send(&app, get_request("/api/v1/agent", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], json!("MISSING_API_KEY"));

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/v1/messages",
                Some(&key),
                json!({ "message": "x".repeat(2001), "channel": "fax" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"].as_array().unwrap().len(), 2);
    }
}
