use std::{sync::Arc, time::Instant};

use serde_json::json;
use uuid::Uuid;

use crate::{
    error::ApiError,
    reply::{GeneratedReply, ReplyRequest},
    resolver::resolve,
    types::{now, Agent, AppState, Conversation, IncomingMessage, Ingested, Message, Sender, User},
};

/// Messages handed to the reply generator as context.
const HISTORY_WINDOW: i64 = 20;

async fn generate_reply(
    state: &AppState,
    agent: &Agent,
    conversation: &Conversation,
    content: &str,
) -> GeneratedReply {
    let started = Instant::now();
    let elapsed_ms = |started: Instant| started.elapsed().as_millis() as u64;

    let history = match state
        .store
        .recent_messages(conversation.id, HISTORY_WINDOW)
        .await
    {
        Ok(history) => history,
        Err(err) => {
            tracing::warn!(conversation_id = %conversation.id, error = %err, "could not load reply context");
            Vec::new()
        }
    };
    let request = ReplyRequest {
        content,
        agent_name: &agent.name,
        persona: &agent.persona,
        conversation,
        history: &history,
    };

    match tokio::time::timeout(state.config.reply_timeout, state.replies.generate(&request)).await
    {
        Ok(Ok(draft)) => GeneratedReply::from_draft(draft, elapsed_ms(started)),
        Ok(Err(err)) => {
            tracing::warn!(
                agent_id = %agent.id,
                conversation_id = %conversation.id,
                error = %err,
                "reply generation failed, using fallback"
            );
            GeneratedReply::degraded(agent.persona.language, elapsed_ms(started))
        }
        Err(_) => {
            tracing::warn!(
                agent_id = %agent.id,
                conversation_id = %conversation.id,
                timeout_ms = state.config.reply_timeout.as_millis() as u64,
                "reply generation timed out, using fallback"
            );
            GeneratedReply::degraded(agent.persona.language, elapsed_ms(started))
        }
    }
}

/// Resolve, persist inbound, generate, persist reply, touch conversation.
///
/// Fan-out is left to the caller so the HTTP response never waits on it.
pub async fn ingest(
    state: &AppState,
    agent_id: Uuid,
    incoming: IncomingMessage,
) -> Result<(Agent, Ingested), ApiError> {
    let agent = state
        .store
        .find_agent(agent_id)
        .await?
        .filter(|agent| agent.is_active)
        .ok_or_else(|| ApiError::not_found("AGENT_NOT_FOUND", "Agent not found"))?;

    let conversation = resolve(
        state.store.as_ref(),
        agent.id,
        &incoming.customer_identifier,
        incoming.channel,
    )
    .await?;

    let customer_message = Message::new(
        conversation.id,
        Sender::Customer,
        incoming.content,
        incoming.metadata,
    );
    state.store.insert_message(&customer_message).await?;

    let reply = generate_reply(state, &agent, &conversation, &customer_message.content).await;
    let reply_message = Message::new(
        conversation.id,
        Sender::Ai,
        reply.content.clone(),
        reply.metadata(),
    );
    state.store.insert_message(&reply_message).await?;

    let conversation = state
        .store
        .touch_conversation(conversation.id, reply_message.created_at)
        .await?
        .unwrap_or(conversation);

    tracing::info!(
        agent_id = %agent.id,
        conversation_id = %conversation.id,
        channel = %conversation.channel,
        intent = reply.intent.as_str(),
        degraded = reply.degraded,
        "message ingested"
    );

    Ok((
        agent,
        Ingested {
            conversation,
            customer_message,
            reply_message,
        },
    ))
}

/// Ingest and schedule fan-out; what every entry adapter calls.
pub async fn ingest_and_publish(
    state: &Arc<AppState>,
    agent_id: Uuid,
    incoming: IncomingMessage,
) -> Result<Ingested, ApiError> {
    let (agent, ingested) = ingest(state, agent_id, incoming).await?;
    crate::dispatch::publish_ingested(
        state.clone(),
        &agent,
        &ingested.conversation,
        &ingested.customer_message,
        &ingested.reply_message,
    );
    Ok(ingested)
}

/// Human reply from the dashboard. No reply generation; status pending
/// becomes open, a closed conversation stays closed.
pub async fn send_operator_message(
    state: &Arc<AppState>,
    agent: &Agent,
    conversation_id: Uuid,
    user: &User,
    content: String,
) -> Result<Message, ApiError> {
    let conversation = state
        .store
        .find_conversation(agent.id, conversation_id)
        .await?
        .ok_or_else(|| ApiError::not_found("CONVERSATION_NOT_FOUND", "Conversation not found"))?;

    let message = Message::new(
        conversation.id,
        Sender::User,
        content,
        json!({ "user_id": user.id, "user_name": user.name }),
    );
    state.store.insert_message(&message).await?;
    state
        .store
        .touch_conversation(conversation.id, now())
        .await?;

    crate::dispatch::publish_operator_message(state.clone(), &message);
    Ok(message)
}
