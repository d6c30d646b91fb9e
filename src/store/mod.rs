use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    Agent, AgentUpdate, Conversation, ConversationFilter, ConversationPatch, ConversationSummary, Integration,
    KnowledgeFile, Message, Page, ServiceName, User, UserUpdate,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Decode(String),
    #[error("missing parent row: {0}")]
    ForeignKey(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable records for every entity. Inserts guarded by a uniqueness rule
/// return `false` when another writer got there first; callers re-read.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_user(&self, user: &User) -> StoreResult<bool>;
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    /// `StoreError::Conflict` when the new email belongs to another user.
    async fn update_user(
        &self,
        id: Uuid,
        update: &UserUpdate,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<User>>;
    /// Swaps the profile picture and returns the one it replaced.
    async fn replace_profile_picture(
        &self,
        id: Uuid,
        url: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<String>>;

    async fn insert_auth_token(
        &self,
        token: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    /// Active users holding a token that has not expired at `at`.
    async fn find_user_by_token(&self, token: &str, at: DateTime<Utc>)
        -> StoreResult<Option<User>>;
    async fn delete_expired_auth_tokens(&self, at: DateTime<Utc>) -> StoreResult<u64>;
    /// Drops every token of the user except `keep`.
    async fn revoke_auth_tokens(&self, user_id: Uuid, keep: &str) -> StoreResult<u64>;

    /// `false` when the user already has an active agent.
    async fn insert_agent(&self, agent: &Agent) -> StoreResult<bool>;
    async fn find_agent(&self, id: Uuid) -> StoreResult<Option<Agent>>;
    async fn find_active_agent_for_user(&self, user_id: Uuid) -> StoreResult<Option<Agent>>;
    /// Active agent owned by an active user.
    async fn find_agent_by_api_key(&self, api_key: &str) -> StoreResult<Option<Agent>>;
    async fn find_agent_by_ingress_path(&self, path: &str) -> StoreResult<Option<Agent>>;
    /// Writes only the fields set in `update`; `None` when the agent is gone.
    async fn update_agent(
        &self,
        id: Uuid,
        update: &AgentUpdate,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Agent>>;
    /// Swaps the avatar and returns the one it replaced.
    async fn replace_agent_avatar(
        &self,
        id: Uuid,
        avatar_url: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<String>>;
    /// Touches only the key column; the old key stops matching at once.
    async fn rotate_api_key(&self, id: Uuid, api_key: &str, at: DateTime<Utc>)
        -> StoreResult<bool>;

    async fn upsert_integration(&self, integration: &Integration) -> StoreResult<Integration>;
    async fn find_integration(
        &self,
        agent_id: Uuid,
        service: ServiceName,
    ) -> StoreResult<Option<Integration>>;
    async fn list_integrations(&self, agent_id: Uuid) -> StoreResult<Vec<Integration>>;

    async fn insert_knowledge_file(&self, file: &KnowledgeFile) -> StoreResult<()>;
    async fn list_knowledge_files(&self, agent_id: Uuid) -> StoreResult<Vec<KnowledgeFile>>;
    async fn find_knowledge_file(
        &self,
        agent_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<KnowledgeFile>>;
    async fn delete_knowledge_file(&self, agent_id: Uuid, id: Uuid) -> StoreResult<bool>;

    async fn find_open_conversation(
        &self,
        agent_id: Uuid,
        customer_identifier: &str,
    ) -> StoreResult<Option<Conversation>>;
    /// `false` when a non-closed conversation for the same customer exists.
    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<bool>;
    async fn find_conversation(&self, agent_id: Uuid, id: Uuid)
        -> StoreResult<Option<Conversation>>;
    async fn list_conversations(
        &self,
        agent_id: Uuid,
        filter: &ConversationFilter,
    ) -> StoreResult<Page<ConversationSummary>>;
    /// `StoreError::Conflict` when reopening would collide with another
    /// non-closed conversation of the same customer.
    async fn update_conversation(
        &self,
        agent_id: Uuid,
        id: Uuid,
        patch: &ConversationPatch,
    ) -> StoreResult<Option<Conversation>>;
    /// Moves `last_activity_at` forward (never back) and turns pending
    /// statuses into `open`. Closed conversations stay closed.
    async fn touch_conversation(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Conversation>>;

    async fn insert_message(&self, message: &Message) -> StoreResult<()>;
    /// Oldest first.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Page<Message>>;
    /// The newest `limit` messages, returned oldest first.
    async fn recent_messages(&self, conversation_id: Uuid, limit: i64)
        -> StoreResult<Vec<Message>>;
}
