use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::{
    agents::Operator,
    dispatch::publish_conversation_update,
    error::ApiError,
    pipeline::send_operator_message,
    store::StoreError,
    types::{
        AppState, Channel, ConversationFilter, ConversationStatus, ListConversationsQuery,
        OperatorMessageBody, PageQuery, PatchConversationBody,
    },
    validation::ValidJson,
};

pub const MAX_PAGE_SIZE: i64 = 100;

/// Clamps a requested page to `1..=100` rows and a non-negative offset.
pub fn page_bounds(limit: Option<i64>, offset: Option<i64>, default_limit: i64) -> (i64, i64) {
    (
        limit.unwrap_or(default_limit).clamp(1, MAX_PAGE_SIZE),
        offset.unwrap_or(0).max(0),
    )
}

fn parse_filter(query: ListConversationsQuery) -> Result<ConversationFilter, ApiError> {
    let (limit, offset) = page_bounds(query.limit, query.offset, 20);
    let status = query
        .status
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.trim().parse::<ConversationStatus>())
        .transpose()
        .map_err(|err| ApiError::invalid("status", err))?;
    let channel = query
        .channel
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.trim().parse::<Channel>())
        .transpose()
        .map_err(|err| ApiError::invalid("channel", err))?;
    Ok(ConversationFilter {
        search: query
            .search
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        status,
        channel,
        limit,
        offset,
    })
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
    Query(query): Query<ListConversationsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = parse_filter(query)?;
    let page = state.store.list_conversations(agent.id, &filter).await?;
    Ok(Json(json!({
        "success": true,
        "pagination": page.pagination(filter.limit, filter.offset),
        "conversations": page.items,
    })))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state
        .store
        .find_conversation(agent.id, conversation_id)
        .await?
        .ok_or_else(|| ApiError::not_found("CONVERSATION_NOT_FOUND", "Conversation not found"))?;
    let (limit, offset) = page_bounds(query.limit, query.offset, 50);
    let page = state
        .store
        .list_messages(conversation.id, limit, offset)
        .await?;

    Ok(Json(json!({
        "success": true,
        "conversation": {
            "id": conversation.id,
            "customer_identifier": conversation.customer_identifier,
            "status": conversation.status,
            "channel": conversation.channel,
        },
        "pagination": page.pagination(limit, offset),
        "messages": page.items,
    })))
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Operator { user, agent }: Operator,
    Path(conversation_id): Path<Uuid>,
    ValidJson(content): ValidJson<OperatorMessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let message = send_operator_message(&state, &agent, conversation_id, &user, content).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "message": message })),
    ))
}

pub async fn update_conversation(
    State(state): State<Arc<AppState>>,
    Operator { agent, .. }: Operator,
    Path(conversation_id): Path<Uuid>,
    ValidJson(patch): ValidJson<PatchConversationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state
        .store
        .update_conversation(agent.id, conversation_id, &patch)
        .await
        .map_err(|err| match err {
            StoreError::Conflict(_) => ApiError::conflict(
                "CONVERSATION_ALREADY_OPEN",
                "The customer already has another open conversation",
            ),
            other => other.into(),
        })?
        .ok_or_else(|| ApiError::not_found("CONVERSATION_NOT_FOUND", "Conversation not found"))?;

    tracing::info!(
        agent_id = %agent.id,
        conversation_id = %conversation.id,
        status = %conversation.status,
        "conversation updated"
    );
    publish_conversation_update(state.clone(), &conversation);

    Ok(Json(json!({
        "success": true,
        "conversation": conversation.update_event(),
    })))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        app::test_support::{get_request, json_request, register_operator, send, test_app},
        pipeline::ingest,
        types::IncomingMessage,
    };

    fn incoming(customer: &str, content: &str) -> IncomingMessage {
        IncomingMessage {
            customer_identifier: customer.to_string(),
            content: content.to_string(),
            channel: Channel::Web,
            metadata: json!({}),
        }
    }

    fn agent_id(agent: &Value) -> Uuid {
        serde_json::from_value(agent["id"].clone()).unwrap()
    }

    #[test]
    fn page_bounds_are_clamped() {
        assert_eq!(page_bounds(None, None, 20), (20, 0));
        assert_eq!(page_bounds(Some(0), Some(-5), 20), (1, 0));
        assert_eq!(page_bounds(Some(500), Some(40), 20), (100, 40));
    }

    #[tokio::test]
    async fn listing_filters_searches_and_paginates() {
        let (app, state) = test_app();
        let (token, agent) = register_operator(&app, "hana@example.com").await;
        let agent_id = agent_id(&agent);
        for customer in ["alice-1", "ALICE-2", "bob"] {
            ingest(&state, agent_id, incoming(customer, "hello")).await.unwrap();
        }

        let (status, body) = send(
            &app,
            get_request("/api/conversations?search=alice&limit=1", Some(&token)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["total"], json!(2));
        assert_eq!(body["pagination"]["has_more"], json!(true));
        let first = &body["conversations"][0];
        assert_eq!(first["customer_identifier"], json!("ALICE-2"));
        assert_eq!(first["last_message"]["sender"], json!("ai"));

        let (status, body) = send(
            &app,
            get_request("/api/conversations?status=archived", Some(&token)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"][0]["field"], json!("status"));
    }

    #[tokio::test]
    async fn operator_reply_and_history() {
        let (app, state) = test_app();
        let (token, agent) = register_operator(&app, "ines@example.com").await;
        let (_, ingested) = ingest(&state, agent_id(&agent), incoming("c1", "hi"))
            .await
            .unwrap();
        let uri = format!("/api/conversations/{}/messages", ingested.conversation.id);

        let (status, body) = send(
            &app,
            json_request("POST", &uri, Some(&token), json!({ "content": "  On it!  " })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["message"]["sender"], json!("user"));
        assert_eq!(body["message"]["content"], json!("On it!"));
        assert_eq!(body["message"]["metadata"]["user_name"], json!("Operator"));

        let (status, body) = send(&app, get_request(&uri, Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        let senders = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["sender"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(senders, ["customer", "ai", "user"]);

        let (status, body) = send(
            &app,
            json_request("POST", &uri, Some(&token), json!({ "content": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn other_operators_cannot_touch_the_conversation() {
        let (app, state) = test_app();
        let (_, owner) = register_operator(&app, "joana@example.com").await;
        let (intruder, _) = register_operator(&app, "kim@example.com").await;
        let (_, ingested) = ingest(&state, agent_id(&owner), incoming("c1", "hi"))
            .await
            .unwrap();
        let id = ingested.conversation.id;

        let (status, body) = send(
            &app,
            get_request(&format!("/api/conversations/{id}/messages"), Some(&intruder)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("CONVERSATION_NOT_FOUND"));

        let (status, _) = send(
            &app,
            json_request(
                "PATCH",
                &format!("/api/conversations/{id}"),
                Some(&intruder),
                json!({ "status": "closed" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn patch_updates_and_notifies_subscribers() {
        let (app, state) = test_app();
        let (token, agent) = register_operator(&app, "lia@example.com").await;
        let (_, ingested) = ingest(&state, agent_id(&agent), incoming("c1", "hi"))
            .await
            .unwrap();
        let id = ingested.conversation.id;
        let (client, mut rx) = state.realtime.connect().await;
        state.realtime.join(client, id).await;

        let (status, body) = send(
            &app,
            json_request(
                "PATCH",
                &format!("/api/conversations/{id}"),
                Some(&token),
                json!({ "status": "closed", "satisfaction_rating": 5, "tags": ["vip", "vip", "billing"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conversation"]["status"], json!("closed"));
        assert_eq!(body["conversation"]["tags"], json!(["vip", "billing"]));

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let frame: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["event"], json!("conversation_updated"));
        assert_eq!(frame["data"]["satisfaction_rating"], json!(5));

        let (status, body) = send(
            &app,
            json_request(
                "PATCH",
                &format!("/api/conversations/{id}"),
                Some(&token),
                json!({ "satisfaction_rating": 9 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"][0]["field"], json!("satisfaction_rating"));
    }
}
