use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::types::{
    now, Agent, AgentUpdate, Conversation, ConversationFilter, ConversationPatch, ConversationStatus,
    ConversationSummary, Integration, KnowledgeFile, Message, Page, ServiceName, User, UserUpdate,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    /// token -> (user, expires_at)
    auth_tokens: HashMap<String, (Uuid, DateTime<Utc>)>,
    agents: HashMap<Uuid, Agent>,
    integrations: HashMap<(Uuid, ServiceName), Integration>,
    knowledge_files: HashMap<Uuid, KnowledgeFile>,
    conversations: HashMap<Uuid, Conversation>,
    /// Per conversation, in insertion order.
    messages: HashMap<Uuid, Vec<Message>>,
}

impl Tables {
    fn open_conversation(&self, agent_id: Uuid, customer: &str) -> Option<&Conversation> {
        self.conversations.values().find(|c| {
            c.agent_id == agent_id
                && c.customer_identifier == customer
                && c.status != ConversationStatus::Closed
        })
    }
}

/// Process-local store for development and tests. Every uniqueness rule of
/// the relational schema is checked under the same write lock as the insert.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_user(&self, user: &User) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.users.values().any(|u| u.email == user.email) {
            return Ok(false);
        }
        tables.users.insert(user.id, user.clone());
        Ok(true)
    }

    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| u.email == email).cloned())
    }

    async fn update_user(
        &self,
        id: Uuid,
        update: &UserUpdate,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        let mut tables = self.tables.write().await;
        if let Some(email) = &update.email {
            if tables.users.values().any(|u| u.id != id && &u.email == email) {
                return Err(StoreError::Conflict(format!("email {email}")));
            }
        }
        Ok(tables.users.get_mut(&id).map(|user| {
            if let Some(name) = &update.name {
                user.name = name.clone();
            }
            if let Some(email) = &update.email {
                user.email = email.clone();
            }
            if let Some(hash) = &update.password_hash {
                user.password_hash = hash.clone();
            }
            user.updated_at = at;
            user.clone()
        }))
    }

    async fn replace_profile_picture(
        &self,
        id: Uuid,
        url: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<String>> {
        let mut tables = self.tables.write().await;
        Ok(tables.users.get_mut(&id).and_then(|user| {
            user.updated_at = at;
            user.profile_picture_url.replace(url.to_string())
        }))
    }

    async fn insert_auth_token(
        &self,
        token: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&user_id) {
            return Err(StoreError::ForeignKey(format!("user {user_id}")));
        }
        tables
            .auth_tokens
            .insert(token.to_string(), (user_id, expires_at));
        Ok(())
    }

    async fn find_user_by_token(
        &self,
        token: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .auth_tokens
            .get(token)
            .filter(|(_, expires_at)| *expires_at > at)
            .and_then(|(user_id, _)| tables.users.get(user_id))
            .filter(|user| user.is_active)
            .cloned())
    }

    async fn delete_expired_auth_tokens(&self, at: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.auth_tokens.len();
        tables.auth_tokens.retain(|_, (_, expires_at)| *expires_at > at);
        Ok((before - tables.auth_tokens.len()) as u64)
    }

    async fn revoke_auth_tokens(&self, user_id: Uuid, keep: &str) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.auth_tokens.len();
        tables
            .auth_tokens
            .retain(|token, (owner, _)| *owner != user_id || token == keep);
        Ok((before - tables.auth_tokens.len()) as u64)
    }

    async fn insert_agent(&self, agent: &Agent) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&agent.user_id) {
            return Err(StoreError::ForeignKey(format!("user {}", agent.user_id)));
        }
        if agent.is_active
            && tables
                .agents
                .values()
                .any(|a| a.user_id == agent.user_id && a.is_active)
        {
            return Ok(false);
        }
        if tables.agents.values().any(|a| {
            a.public_api_key == agent.public_api_key
                || a.ingress_webhook_path == agent.ingress_webhook_path
        }) {
            return Err(StoreError::Conflict(format!("agent {}", agent.id)));
        }
        tables.agents.insert(agent.id, agent.clone());
        Ok(true)
    }

    async fn find_agent(&self, id: Uuid) -> StoreResult<Option<Agent>> {
        Ok(self.tables.read().await.agents.get(&id).cloned())
    }

    async fn find_active_agent_for_user(&self, user_id: Uuid) -> StoreResult<Option<Agent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .agents
            .values()
            .find(|a| a.user_id == user_id && a.is_active)
            .cloned())
    }

    async fn find_agent_by_api_key(&self, api_key: &str) -> StoreResult<Option<Agent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .agents
            .values()
            .find(|a| a.public_api_key == api_key && a.is_active)
            .filter(|a| {
                tables
                    .users
                    .get(&a.user_id)
                    .map(|u| u.is_active)
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn find_agent_by_ingress_path(&self, path: &str) -> StoreResult<Option<Agent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .agents
            .values()
            .find(|a| a.ingress_webhook_path == path && a.is_active)
            .cloned())
    }

    async fn update_agent(
        &self,
        id: Uuid,
        update: &AgentUpdate,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Agent>> {
        let mut tables = self.tables.write().await;
        let Some(user_id) = tables.agents.get(&id).map(|a| a.user_id) else {
            return Ok(None);
        };
        if update.is_active == Some(true)
            && tables
                .agents
                .values()
                .any(|a| a.id != id && a.user_id == user_id && a.is_active)
        {
            return Err(StoreError::Conflict(format!("agent {id}")));
        }
        Ok(tables.agents.get_mut(&id).map(|agent| {
            update.apply(agent, at);
            agent.clone()
        }))
    }

    async fn replace_agent_avatar(
        &self,
        id: Uuid,
        avatar_url: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<String>> {
        let mut tables = self.tables.write().await;
        Ok(tables.agents.get_mut(&id).and_then(|agent| {
            agent.updated_at = at;
            agent.avatar_url.replace(avatar_url.to_string())
        }))
    }

    async fn rotate_api_key(
        &self,
        id: Uuid,
        api_key: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        if tables
            .agents
            .values()
            .any(|a| a.id != id && a.public_api_key == api_key)
        {
            return Err(StoreError::Conflict(format!("agent {id}")));
        }
        Ok(match tables.agents.get_mut(&id) {
            Some(agent) => {
                agent.public_api_key = api_key.to_string();
                agent.updated_at = at;
                true
            }
            None => false,
        })
    }

    async fn upsert_integration(&self, integration: &Integration) -> StoreResult<Integration> {
        let mut tables = self.tables.write().await;
        let key = (integration.agent_id, integration.service_name);
        let stored = match tables.integrations.get_mut(&key) {
            Some(existing) => {
                existing.credentials = integration.credentials.clone();
                existing.is_active = integration.is_active;
                existing.updated_at = integration.updated_at;
                existing.clone()
            }
            None => {
                tables.integrations.insert(key, integration.clone());
                integration.clone()
            }
        };
        Ok(stored)
    }

    async fn find_integration(
        &self,
        agent_id: Uuid,
        service: ServiceName,
    ) -> StoreResult<Option<Integration>> {
        let tables = self.tables.read().await;
        Ok(tables.integrations.get(&(agent_id, service)).cloned())
    }

    async fn list_integrations(&self, agent_id: Uuid) -> StoreResult<Vec<Integration>> {
        let tables = self.tables.read().await;
        let mut list = tables
            .integrations
            .values()
            .filter(|i| i.agent_id == agent_id)
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by_key(|i| i.connected_at);
        Ok(list)
    }

    async fn insert_knowledge_file(&self, file: &KnowledgeFile) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.knowledge_files.insert(file.id, file.clone());
        Ok(())
    }

    async fn list_knowledge_files(&self, agent_id: Uuid) -> StoreResult<Vec<KnowledgeFile>> {
        let tables = self.tables.read().await;
        let mut list = tables
            .knowledge_files
            .values()
            .filter(|f| f.agent_id == agent_id)
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(list)
    }

    async fn find_knowledge_file(
        &self,
        agent_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<KnowledgeFile>> {
        let tables = self.tables.read().await;
        Ok(tables
            .knowledge_files
            .get(&id)
            .filter(|f| f.agent_id == agent_id)
            .cloned())
    }

    async fn delete_knowledge_file(&self, agent_id: Uuid, id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let owned = tables
            .knowledge_files
            .get(&id)
            .map(|f| f.agent_id == agent_id)
            .unwrap_or(false);
        if owned {
            tables.knowledge_files.remove(&id);
        }
        Ok(owned)
    }

    async fn find_open_conversation(
        &self,
        agent_id: Uuid,
        customer_identifier: &str,
    ) -> StoreResult<Option<Conversation>> {
        let tables = self.tables.read().await;
        Ok(tables
            .open_conversation(agent_id, customer_identifier)
            .cloned())
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        if !tables.agents.contains_key(&conversation.agent_id) {
            return Err(StoreError::ForeignKey(format!(
                "agent {}",
                conversation.agent_id
            )));
        }
        if conversation.status != ConversationStatus::Closed
            && tables
                .open_conversation(conversation.agent_id, &conversation.customer_identifier)
                .is_some()
        {
            return Ok(false);
        }
        tables
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(true)
    }

    async fn find_conversation(
        &self,
        agent_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<Conversation>> {
        let tables = self.tables.read().await;
        Ok(tables
            .conversations
            .get(&id)
            .filter(|c| c.agent_id == agent_id)
            .cloned())
    }

    async fn list_conversations(
        &self,
        agent_id: Uuid,
        filter: &ConversationFilter,
    ) -> StoreResult<Page<ConversationSummary>> {
        let tables = self.tables.read().await;
        let needle = filter.search.as_ref().map(|s| s.to_lowercase());
        let mut matching = tables
            .conversations
            .values()
            .filter(|c| c.agent_id == agent_id)
            .filter(|c| filter.status.map_or(true, |s| c.status == s))
            .filter(|c| filter.channel.map_or(true, |ch| c.channel == ch))
            .filter(|c| {
                needle
                    .as_ref()
                    .map_or(true, |n| c.customer_identifier.to_lowercase().contains(n))
            })
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .map(|c| ConversationSummary {
                conversation: c.clone(),
                last_message: tables
                    .messages
                    .get(&c.id)
                    .and_then(|list| list.last())
                    .cloned(),
            })
            .collect();
        Ok(Page { items, total })
    }

    async fn update_conversation(
        &self,
        agent_id: Uuid,
        id: Uuid,
        patch: &ConversationPatch,
    ) -> StoreResult<Option<Conversation>> {
        let mut tables = self.tables.write().await;
        let Some(current) = tables
            .conversations
            .get(&id)
            .filter(|c| c.agent_id == agent_id)
            .cloned()
        else {
            return Ok(None);
        };
        if let Some(status) = patch.status {
            let reopening =
                current.status == ConversationStatus::Closed && status != ConversationStatus::Closed;
            let clash = tables
                .open_conversation(agent_id, &current.customer_identifier)
                .map(|other| other.id != id)
                .unwrap_or(false);
            if reopening && clash {
                return Err(StoreError::Conflict(format!(
                    "another conversation with the same customer is already open ({id})"
                )));
            }
        }
        let Some(conversation) = tables.conversations.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(status) = patch.status {
            conversation.status = status;
        }
        if let Some(rating) = patch.satisfaction_rating {
            conversation.satisfaction_rating = Some(rating);
        }
        if let Some(tags) = &patch.tags {
            conversation.tags = tags.clone();
        }
        conversation.updated_at = now();
        Ok(Some(conversation.clone()))
    }

    async fn touch_conversation(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Conversation>> {
        let mut tables = self.tables.write().await;
        let Some(conversation) = tables.conversations.get_mut(&id) else {
            return Ok(None);
        };
        if at > conversation.last_activity_at {
            conversation.last_activity_at = at;
        }
        if conversation.status.is_pending() {
            conversation.status = ConversationStatus::Open;
        }
        conversation.updated_at = now();
        Ok(Some(conversation.clone()))
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::ForeignKey(format!(
                "conversation {}",
                message.conversation_id
            )));
        }
        tables
            .messages
            .entry(message.conversation_id)
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Page<Message>> {
        let tables = self.tables.read().await;
        let all = tables
            .messages
            .get(&conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(Page {
            total: all.len() as i64,
            items: all
                .iter()
                .skip(offset.max(0) as usize)
                .take(limit.max(0) as usize)
                .cloned()
                .collect(),
        })
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let tables = self.tables.read().await;
        let all = tables
            .messages
            .get(&conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let start = all.len().saturating_sub(limit.max(0) as usize);
        Ok(all[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, Sender};
    use chrono::Duration;
    use serde_json::json;

    async fn seeded() -> (MemoryStore, Agent) {
        let store = MemoryStore::new();
        let user = User::new("Ana", "ana@example.com", "hash".into());
        assert!(store.insert_user(&user).await.unwrap());
        let agent = Agent::new_for_user(user.id, "Assistant for Ana".into());
        assert!(store.insert_agent(&agent).await.unwrap());
        (store, agent)
    }

    #[tokio::test]
    async fn only_one_active_agent_per_user() {
        let (store, agent) = seeded().await;
        let second = Agent::new_for_user(agent.user_id, "Other".into());
        assert!(!store.insert_agent(&second).await.unwrap());
        let found = store
            .find_active_agent_for_user(agent.user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, agent.id);
    }

    #[tokio::test]
    async fn settings_and_avatar_writes_never_restore_a_rotated_key() {
        let (store, agent) = seeded().await;
        let old_key = agent.public_api_key.clone();
        // Copy read before the rotation, as a concurrent request would hold it.
        let stale = agent.clone();

        assert!(store
            .rotate_api_key(agent.id, "sk_rotated", now())
            .await
            .unwrap());

        let rename = AgentUpdate {
            name: Some(format!("{} (renamed)", stale.name)),
            ..Default::default()
        };
        let updated = store
            .update_agent(stale.id, &rename, now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.public_api_key, "sk_rotated");
        let previous = store
            .replace_agent_avatar(stale.id, "/uploads/avatars/new.png", now())
            .await
            .unwrap();
        assert_eq!(previous, None);

        assert!(store.find_agent_by_api_key(&old_key).await.unwrap().is_none());
        let current = store
            .find_agent_by_api_key("sk_rotated")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.name, "Assistant for Ana (renamed)");
        assert_eq!(current.avatar_url.as_deref(), Some("/uploads/avatars/new.png"));
    }

    #[tokio::test]
    async fn partial_updates_keep_concurrent_persona_edits() {
        let (store, agent) = seeded().await;
        let tone = AgentUpdate {
            tone: Some(crate::types::Tone::Empathetic),
            ..Default::default()
        };
        let emojis = AgentUpdate {
            allow_emojis: Some(false),
            ..Default::default()
        };
        store.update_agent(agent.id, &tone, now()).await.unwrap();
        let merged = store
            .update_agent(agent.id, &emojis, now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.persona.tone, crate::types::Tone::Empathetic);
        assert!(!merged.persona.allow_emojis);

        let missing = store
            .update_agent(uuid::Uuid::new_v4(), &tone, now())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn expired_tokens_stop_authenticating_and_are_pruned() {
        let (store, agent) = seeded().await;
        let issued = now();
        store
            .insert_auth_token("tok_live", agent.user_id, issued + Duration::hours(1))
            .await
            .unwrap();
        store
            .insert_auth_token("tok_old", agent.user_id, issued - Duration::seconds(1))
            .await
            .unwrap();

        assert!(store.find_user_by_token("tok_live", issued).await.unwrap().is_some());
        assert!(store.find_user_by_token("tok_old", issued).await.unwrap().is_none());
        assert!(store
            .find_user_by_token("tok_live", issued + Duration::hours(2))
            .await
            .unwrap()
            .is_none());

        assert_eq!(store.delete_expired_auth_tokens(issued).await.unwrap(), 1);
        assert_eq!(store.revoke_auth_tokens(agent.user_id, "tok_live").await.unwrap(), 0);
        assert_eq!(store.revoke_auth_tokens(agent.user_id, "other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn open_conversation_is_unique_per_customer_until_closed() {
        let (store, agent) = seeded().await;
        let first = Conversation::open(agent.id, "c1", Channel::Web);
        assert!(store.insert_conversation(&first).await.unwrap());
        let dup = Conversation::open(agent.id, "c1", Channel::Api);
        assert!(!store.insert_conversation(&dup).await.unwrap());

        let close = ConversationPatch {
            status: Some(ConversationStatus::Closed),
            ..Default::default()
        };
        store
            .update_conversation(agent.id, first.id, &close)
            .await
            .unwrap();
        assert!(store.insert_conversation(&dup).await.unwrap());

        let reopen = ConversationPatch {
            status: Some(ConversationStatus::Open),
            ..Default::default()
        };
        let err = store
            .update_conversation(agent.id, first.id, &reopen)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn touch_never_moves_activity_backwards_or_reopens() {
        let (store, agent) = seeded().await;
        let mut conversation = Conversation::open(agent.id, "c1", Channel::Web);
        conversation.status = ConversationStatus::PendingHuman;
        store.insert_conversation(&conversation).await.unwrap();

        let later = conversation.last_activity_at + Duration::seconds(30);
        let touched = store
            .touch_conversation(conversation.id, later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(touched.status, ConversationStatus::Open);
        let earlier = conversation.last_activity_at - Duration::seconds(30);
        let touched = store
            .touch_conversation(conversation.id, earlier)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(touched.last_activity_at, later);

        let close = ConversationPatch {
            status: Some(ConversationStatus::Closed),
            ..Default::default()
        };
        store
            .update_conversation(agent.id, conversation.id, &close)
            .await
            .unwrap();
        let touched = store
            .touch_conversation(conversation.id, later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(touched.status, ConversationStatus::Closed);
    }

    #[tokio::test]
    async fn listing_filters_by_search_and_reports_last_message() {
        let (store, agent) = seeded().await;
        for customer in ["Maria Silva", "joao", "MARIANA"] {
            let conversation = Conversation::open(agent.id, customer, Channel::Web);
            store.insert_conversation(&conversation).await.unwrap();
            let message = Message::new(
                conversation.id,
                Sender::Customer,
                format!("hi from {customer}"),
                json!({}),
            );
            store.insert_message(&message).await.unwrap();
        }
        let page = store
            .list_conversations(
                agent.id,
                &ConversationFilter {
                    search: Some("mari".into()),
                    limit: 1,
                    offset: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert!(page.items[0].last_message.is_some());
    }

    #[tokio::test]
    async fn messages_require_an_existing_conversation() {
        let store = MemoryStore::new();
        let orphan = Message::new(Uuid::new_v4(), Sender::Ai, "hello".into(), json!({}));
        assert!(matches!(
            store.insert_message(&orphan).await,
            Err(StoreError::ForeignKey(_))
        ));
    }
}
