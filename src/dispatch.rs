use std::{fmt::Display, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    realtime::{EVENT_CONVERSATION_UPDATED, EVENT_NEW_MESSAGE},
    types::{Agent, AppState, Conversation, Message},
};

/// Runs best-effort work off the request path. A failure is reported here
/// and nowhere else; committed state is never touched.
pub fn spawn_detached<F, E>(label: &'static str, work: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = work.await {
            tracing::warn!(task = label, error = %err, "background task failed");
        }
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundReply {
    pub content: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Body POSTed to an agent's outbound webhook for every ingested message.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEvent {
    pub conversation_id: Uuid,
    pub customer_identifier: String,
    pub customer_message: OutboundMessage,
    pub ai_response: OutboundReply,
}

impl OutboundEvent {
    pub fn new(conversation: &Conversation, customer: &Message, reply: &Message) -> Self {
        Self {
            conversation_id: conversation.id,
            customer_identifier: conversation.customer_identifier.clone(),
            customer_message: OutboundMessage {
                content: customer.content.clone(),
                timestamp: customer.created_at,
            },
            ai_response: OutboundReply {
                content: reply.content.clone(),
                confidence: reply
                    .metadata
                    .get("confidence")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or_default(),
                timestamp: reply.created_at,
            },
        }
    }
}

/// Fans an ingested message pair out to subscribers and the agent's
/// outbound webhook. An exhausted webhook surfaces as the task's error.
pub fn publish_ingested(
    state: Arc<AppState>,
    agent: &Agent,
    conversation: &Conversation,
    customer_message: &Message,
    reply_message: &Message,
) -> JoinHandle<()> {
    let webhook_url = agent.outbound_webhook_url.clone();
    let agent_id = agent.id;
    let conversation = conversation.clone();
    let customer_message = customer_message.clone();
    let reply_message = reply_message.clone();

    spawn_detached("publish_ingested", async move {
        for message in [&customer_message, &reply_message] {
            state
                .realtime
                .emit_to_conversation(conversation.id, EVENT_NEW_MESSAGE, message)
                .await;
        }

        let Some(url) = webhook_url else {
            return Ok(());
        };
        let event = OutboundEvent::new(&conversation, &customer_message, &reply_message);
        let payload = serde_json::to_value(&event).map_err(|err| err.to_string())?;
        let report = state
            .webhooks
            .deliver(&url, &payload)
            .await
            .map_err(|err| err.to_string())?;
        tracing::debug!(
            %agent_id,
            conversation_id = %conversation.id,
            attempts = report.attempts,
            "outbound webhook delivered"
        );
        Ok::<(), String>(())
    })
}

/// Operator messages go to subscribers only.
pub fn publish_operator_message(state: Arc<AppState>, message: &Message) -> JoinHandle<()> {
    let message = message.clone();
    spawn_detached("publish_operator_message", async move {
        state
            .realtime
            .emit_to_conversation(message.conversation_id, EVENT_NEW_MESSAGE, &message)
            .await;
        Ok::<(), String>(())
    })
}

pub fn publish_conversation_update(
    state: Arc<AppState>,
    conversation: &Conversation,
) -> JoinHandle<()> {
    let conversation = conversation.clone();
    spawn_detached("publish_conversation_update", async move {
        state
            .realtime
            .emit_to_conversation(
                conversation.id,
                EVENT_CONVERSATION_UPDATED,
                conversation.update_event(),
            )
            .await;
        Ok::<(), String>(())
    })
}
