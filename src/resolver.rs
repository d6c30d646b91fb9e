use uuid::Uuid;

use crate::{
    error::ApiError,
    store::Store,
    types::{Channel, Conversation},
};

const MAX_RESOLVE_ATTEMPTS: usize = 3;

/// Finds the non-closed conversation for `(agent, customer)` or opens one.
///
/// Concurrent callers race on the store's uniqueness rule; the loser's insert
/// reports a conflict and it adopts the winner's row on the next read. An
/// existing conversation keeps the channel it was opened on.
pub async fn resolve(
    store: &dyn Store,
    agent_id: Uuid,
    customer_identifier: &str,
    channel: Channel,
) -> Result<Conversation, ApiError> {
    for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
        if let Some(existing) = store
            .find_open_conversation(agent_id, customer_identifier)
            .await?
        {
            return Ok(existing);
        }

        let candidate = Conversation::open(agent_id, customer_identifier, channel);
        if store.insert_conversation(&candidate).await? {
            tracing::debug!(%agent_id, conversation_id = %candidate.id, "opened conversation");
            return Ok(candidate);
        }

        tracing::debug!(%agent_id, attempt, "lost conversation insert race, re-reading");
    }

    Err(ApiError::internal(
        "CONVERSATION_RESOLVE_FAILED",
        format!("could not resolve a conversation after {MAX_RESOLVE_ATTEMPTS} attempts"),
    ))
}
