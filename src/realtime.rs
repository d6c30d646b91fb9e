use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::{
    agents::ensure_active_agent,
    auth::user_from_token,
    error::ApiError,
    types::{AppState, EventEnvelopeIn},
};

pub const EVENT_NEW_MESSAGE: &str = "new_message";
pub const EVENT_CONVERSATION_UPDATED: &str = "conversation_updated";

#[derive(Default)]
struct Subscriptions {
    clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    conversation_watchers: HashMap<Uuid, HashSet<usize>>,
    watched: HashMap<usize, HashSet<Uuid>>,
}

/// Process-local registry of connected sockets and the conversation topics
/// each one follows. Delivery is at-most-once; nothing is persisted.
#[derive(Default)]
pub struct RealtimeHub {
    inner: Mutex<Subscriptions>,
    next_client_id: AtomicUsize,
}

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self) -> (usize, mpsc::UnboundedReceiver<String>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        self.inner.lock().await.clients.insert(client_id, tx);
        (client_id, rx)
    }

    pub async fn disconnect(&self, client_id: usize) {
        let mut rt = self.inner.lock().await;
        rt.clients.remove(&client_id);
        let topics = rt.watched.remove(&client_id).unwrap_or_default();
        for conversation_id in topics {
            let now_empty = match rt.conversation_watchers.get_mut(&conversation_id) {
                Some(set) => {
                    set.remove(&client_id);
                    set.is_empty()
                }
                None => false,
            };
            if now_empty {
                rt.conversation_watchers.remove(&conversation_id);
            }
        }
    }

    pub async fn join(&self, client_id: usize, conversation_id: Uuid) {
        let mut rt = self.inner.lock().await;
        if !rt.clients.contains_key(&client_id) {
            return;
        }
        rt.conversation_watchers
            .entry(conversation_id)
            .or_default()
            .insert(client_id);
        rt.watched
            .entry(client_id)
            .or_default()
            .insert(conversation_id);
    }

    pub async fn leave(&self, client_id: usize, conversation_id: Uuid) {
        let mut rt = self.inner.lock().await;
        if let Some(set) = rt.watched.get_mut(&client_id) {
            set.remove(&conversation_id);
        }
        let now_empty = match rt.conversation_watchers.get_mut(&conversation_id) {
            Some(set) => {
                set.remove(&client_id);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            rt.conversation_watchers.remove(&conversation_id);
        }
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self, conversation_id: Uuid) -> usize {
        let rt = self.inner.lock().await;
        rt.conversation_watchers
            .get(&conversation_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Returns how many sockets the event was queued for.
    pub async fn emit_to_conversation<T: Serialize>(
        &self,
        conversation_id: Uuid,
        event: &str,
        data: T,
    ) -> usize {
        let Some(payload) = event_payload(event, data) else {
            return 0;
        };

        let senders = {
            let rt = self.inner.lock().await;
            rt.conversation_watchers
                .get(&conversation_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| rt.clients.get(id).cloned())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        senders
            .into_iter()
            .filter(|sender| sender.send(payload.clone()).is_ok())
            .count()
    }

    pub async fn emit_to_client<T: Serialize>(&self, client_id: usize, event: &str, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };

        let tx = {
            let rt = self.inner.lock().await;
            rt.clients.get(&client_id).cloned()
        };

        if let Some(sender) = tx {
            let _ = sender.send(payload);
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `GET /ws?token=...`: operator token is checked before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let token = query
        .token
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| ApiError::unauthorized("MISSING_TOKEN", "Access token required"))?;
    let user = user_from_token(&state, token.trim()).await?;
    let agent = ensure_active_agent(state.store.as_ref(), &user).await?;
    let agent_id = agent.id;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, agent_id))
        .into_response())
}

fn conversation_id_of(data: &Value) -> Option<Uuid> {
    data.get("conversationId")
        .or_else(|| data.get("conversation_id"))
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, agent_id: Uuid) {
    let hub = &state.realtime;
    let (client_id, mut rx) = hub.connect().await;
    tracing::debug!(client_id, %agent_id, "realtime client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender
                .send(WsMessage::Text(payload.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "join_conversation" => {
                let Some(conversation_id) = conversation_id_of(&envelope.data) else {
                    hub.emit_to_client(
                        client_id,
                        "error",
                        json!({ "code": "VALIDATION_ERROR", "message": "conversationId is required" }),
                    )
                    .await;
                    continue;
                };
                match state
                    .store
                    .find_conversation(agent_id, conversation_id)
                    .await
                {
                    Ok(Some(_)) => {
                        hub.join(client_id, conversation_id).await;
                        hub.emit_to_client(
                            client_id,
                            "joined",
                            json!({ "conversationId": conversation_id }),
                        )
                        .await;
                    }
                    Ok(None) => {
                        hub.emit_to_client(
                            client_id,
                            "error",
                            json!({
                                "code": "CONVERSATION_NOT_FOUND",
                                "message": "Conversation not found",
                                "conversationId": conversation_id,
                            }),
                        )
                        .await;
                    }
                    Err(err) => {
                        tracing::warn!(client_id, %conversation_id, error = %err, "join lookup failed");
                        hub.emit_to_client(
                            client_id,
                            "error",
                            json!({ "code": "INTERNAL_ERROR", "message": "Could not join conversation" }),
                        )
                        .await;
                    }
                }
            }
            "leave_conversation" => {
                if let Some(conversation_id) = conversation_id_of(&envelope.data) {
                    hub.leave(client_id, conversation_id).await;
                }
            }
            _ => {}
        }
    }

    hub.disconnect(client_id).await;
    send_task.abort();
    tracing::debug!(client_id, "realtime client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_only_joined_clients() {
        let hub = RealtimeHub::new();
        let (watcher, mut watcher_rx) = hub.connect().await;
        let (_bystander, mut bystander_rx) = hub.connect().await;
        let conversation_id = Uuid::new_v4();

        hub.join(watcher, conversation_id).await;
        let delivered = hub
            .emit_to_conversation(conversation_id, EVENT_NEW_MESSAGE, json!({ "content": "hi" }))
            .await;
        assert_eq!(delivered, 1);

        let frame: Value = serde_json::from_str(&watcher_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["event"], json!("new_message"));
        assert_eq!(frame["data"]["content"], json!("hi"));
        assert!(bystander_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leaving_and_disconnecting_drop_subscriptions() {
        let hub = RealtimeHub::new();
        let (a, _rx_a) = hub.connect().await;
        let (b, _rx_b) = hub.connect().await;
        let conversation_id = Uuid::new_v4();
        hub.join(a, conversation_id).await;
        hub.join(b, conversation_id).await;
        assert_eq!(hub.subscriber_count(conversation_id).await, 2);

        hub.leave(a, conversation_id).await;
        assert_eq!(hub.subscriber_count(conversation_id).await, 1);

        hub.disconnect(b).await;
        assert_eq!(hub.subscriber_count(conversation_id).await, 0);
        assert_eq!(
            hub.emit_to_conversation(conversation_id, EVENT_NEW_MESSAGE, json!({}))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn unknown_clients_cannot_join() {
        let hub = RealtimeHub::new();
        let conversation_id = Uuid::new_v4();
        hub.join(42, conversation_id).await;
        assert_eq!(hub.subscriber_count(conversation_id).await, 0);
    }
}
