use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::types::{
    Agent, AgentUpdate, Conversation, ConversationFilter, ConversationPatch, ConversationSummary,
    Integration, KnowledgeFile, Message, Page, Persona, ServiceName, User, UserUpdate,
};

const USER_COLUMNS: &str =
    "u.id, u.name, u.email, u.password_hash, u.profile_picture_url, u.plan, u.is_active, \
     u.created_at, u.updated_at";

const AGENT_COLUMNS: &str = "a.id, a.user_id, a.name, a.avatar_url, a.language, a.mood, \
     a.formality, a.allow_emojis, a.response_speed, a.tone, a.opening_phrase, a.closing_phrase, \
     a.public_api_key, a.ingress_webhook_path, a.outbound_webhook_url, a.is_active, \
     a.created_at, a.updated_at";

const CONVERSATION_COLUMNS: &str = "c.id, c.agent_id, c.customer_identifier, c.status, \
     c.channel, c.last_activity_at, c.satisfaction_rating, c.tags, c.created_at, c.updated_at";

const INTEGRATION_COLUMNS: &str =
    "id, agent_id, service_name, credentials, is_active, connected_at, updated_at";

const KNOWLEDGE_COLUMNS: &str =
    "id, agent_id, file_name, file_url, file_type, file_size, uploaded_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender, content, metadata, created_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_text<T: FromStr<Err = String>>(row: &PgRow, column: &str) -> StoreResult<T> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|err| StoreError::Decode(format!("{column}: {err}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_foreign_key_violation())
        .unwrap_or(false)
}

/// `%` and `_` in user input match literally.
fn like_pattern(search: &str) -> String {
    let escaped = search
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn user_from_row(row: &PgRow) -> StoreResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        profile_picture_url: row.try_get("profile_picture_url")?,
        plan: parse_text(row, "plan")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn agent_from_row(row: &PgRow) -> StoreResult<Agent> {
    Ok(Agent {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        avatar_url: row.try_get("avatar_url")?,
        persona: Persona {
            language: parse_text(row, "language")?,
            mood: parse_text(row, "mood")?,
            formality: parse_text(row, "formality")?,
            allow_emojis: row.try_get("allow_emojis")?,
            response_speed: parse_text(row, "response_speed")?,
            tone: parse_text(row, "tone")?,
            opening_phrase: row.try_get("opening_phrase")?,
            closing_phrase: row.try_get("closing_phrase")?,
        },
        public_api_key: row.try_get("public_api_key")?,
        ingress_webhook_path: row.try_get("ingress_webhook_path")?,
        outbound_webhook_url: row.try_get("outbound_webhook_url")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn integration_from_row(row: &PgRow) -> StoreResult<Integration> {
    Ok(Integration {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        service_name: parse_text(row, "service_name")?,
        credentials: row.try_get("credentials")?,
        is_active: row.try_get("is_active")?,
        connected_at: row.try_get("connected_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn knowledge_from_row(row: &PgRow) -> StoreResult<KnowledgeFile> {
    Ok(KnowledgeFile {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        file_name: row.try_get("file_name")?,
        file_url: row.try_get("file_url")?,
        file_type: parse_text(row, "file_type")?,
        file_size: row.try_get("file_size")?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

fn conversation_from_row(row: &PgRow) -> StoreResult<Conversation> {
    let Json(tags): Json<Vec<String>> = row.try_get("tags")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        customer_identifier: row.try_get("customer_identifier")?,
        status: parse_text(row, "status")?,
        channel: parse_text(row, "channel")?,
        last_activity_at: row.try_get("last_activity_at")?,
        satisfaction_rating: row.try_get("satisfaction_rating")?,
        tags,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &PgRow) -> StoreResult<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender: parse_text(row, "sender")?,
        content: row.try_get("content")?,
        metadata: row.try_get::<Value, _>("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Last-message columns come from the lateral join, prefixed with `m_`.
fn last_message_from_row(row: &PgRow, conversation_id: Uuid) -> StoreResult<Option<Message>> {
    let Some(id) = row.try_get::<Option<Uuid>, _>("m_id")? else {
        return Ok(None);
    };
    let sender: String = row.try_get("m_sender")?;
    Ok(Some(Message {
        id,
        conversation_id,
        sender: sender
            .parse()
            .map_err(|err| StoreError::Decode(format!("m_sender: {err}")))?,
        content: row.try_get("m_content")?,
        metadata: row.try_get::<Value, _>("m_metadata")?,
        created_at: row.try_get("m_created_at")?,
    }))
}

#[async_trait]
impl Store for PgStore {
    async fn insert_user(&self, user: &User) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO users (id, name, email, password_hash, plan, is_active, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (email) DO NOTHING",
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.plan.as_str())
        .bind(user.is_active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users u WHERE u.email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn update_user(
        &self,
        id: Uuid,
        update: &UserUpdate,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!(
            "UPDATE users u SET
                 name = COALESCE($2, u.name),
                 email = COALESCE($3, u.email),
                 password_hash = COALESCE($4, u.password_hash),
                 updated_at = $5
             WHERE u.id = $1
             RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(update.name.as_deref())
        .bind(update.email.as_deref())
        .bind(update.password_hash.as_deref())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict(format!("user {id} email"))
            } else {
                err.into()
            }
        })?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn replace_profile_picture(
        &self,
        id: Uuid,
        url: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<String>> {
        let row = sqlx::query(
            "WITH previous AS (SELECT profile_picture_url FROM users WHERE id = $1 FOR UPDATE)
             UPDATE users SET profile_picture_url = $2, updated_at = $3
             WHERE id = $1
             RETURNING (SELECT profile_picture_url FROM previous) AS previous_url",
        )
        .bind(id)
        .bind(url)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<String>, _>("previous_url")?),
            None => Ok(None),
        }
    }

    async fn insert_auth_token(
        &self,
        token: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO auth_tokens (token, user_id, created_at, expires_at)
             VALUES ($1, $2, NOW(), $3)",
        )
        .bind(token)
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                StoreError::ForeignKey(format!("user {user_id}"))
            } else {
                err.into()
            }
        })?;
        Ok(())
    }

    async fn find_user_by_token(
        &self,
        token: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM auth_tokens t JOIN users u ON u.id = t.user_id
             WHERE t.token = $1 AND t.expires_at > $2 AND u.is_active"
        ))
        .bind(token)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn delete_expired_auth_tokens(&self, at: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE expires_at <= $1")
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_auth_tokens(&self, user_id: Uuid, keep: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE user_id = $1 AND token <> $2")
            .bind(user_id)
            .bind(keep)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_agent(&self, agent: &Agent) -> StoreResult<bool> {
        let persona = &agent.persona;
        let result = sqlx::query(
            "INSERT INTO agents (id, user_id, name, avatar_url, language, mood, formality,
                 allow_emojis, response_speed, tone, opening_phrase, closing_phrase,
                 public_api_key, ingress_webhook_path, outbound_webhook_url, is_active,
                 created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
             ON CONFLICT (user_id) WHERE is_active DO NOTHING",
        )
        .bind(agent.id)
        .bind(agent.user_id)
        .bind(&agent.name)
        .bind(&agent.avatar_url)
        .bind(persona.language.as_str())
        .bind(persona.mood.as_str())
        .bind(persona.formality.as_str())
        .bind(persona.allow_emojis)
        .bind(persona.response_speed.as_str())
        .bind(persona.tone.as_str())
        .bind(&persona.opening_phrase)
        .bind(&persona.closing_phrase)
        .bind(&agent.public_api_key)
        .bind(&agent.ingress_webhook_path)
        .bind(&agent.outbound_webhook_url)
        .bind(agent.is_active)
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                StoreError::ForeignKey(format!("user {}", agent.user_id))
            } else {
                err.into()
            }
        })?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_agent(&self, id: Uuid) -> StoreResult<Option<Agent>> {
        let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents a WHERE a.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn find_active_agent_for_user(&self, user_id: Uuid) -> StoreResult<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents a WHERE a.user_id = $1 AND a.is_active"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn find_agent_by_api_key(&self, api_key: &str) -> StoreResult<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents a JOIN users u ON u.id = a.user_id
             WHERE a.public_api_key = $1 AND a.is_active AND u.is_active"
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn find_agent_by_ingress_path(&self, path: &str) -> StoreResult<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents a WHERE a.ingress_webhook_path = $1 AND a.is_active"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn update_agent(
        &self,
        id: Uuid,
        update: &AgentUpdate,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Agent>> {
        let row = sqlx::query(&format!(
            "UPDATE agents a SET
                 name = COALESCE($2, a.name),
                 language = COALESCE($3, a.language),
                 mood = COALESCE($4, a.mood),
                 formality = COALESCE($5, a.formality),
                 allow_emojis = COALESCE($6, a.allow_emojis),
                 response_speed = COALESCE($7, a.response_speed),
                 tone = COALESCE($8, a.tone),
                 opening_phrase = COALESCE($9, a.opening_phrase),
                 closing_phrase = COALESCE($10, a.closing_phrase),
                 outbound_webhook_url = CASE WHEN $11 THEN $12 ELSE a.outbound_webhook_url END,
                 avatar_url = CASE WHEN $13 THEN $14 ELSE a.avatar_url END,
                 is_active = COALESCE($15, a.is_active),
                 updated_at = $16
             WHERE a.id = $1
             RETURNING {AGENT_COLUMNS}"
        ))
        .bind(id)
        .bind(update.name.as_deref())
        .bind(update.language.map(|v| v.as_str()))
        .bind(update.mood.map(|v| v.as_str()))
        .bind(update.formality.map(|v| v.as_str()))
        .bind(update.allow_emojis)
        .bind(update.response_speed.map(|v| v.as_str()))
        .bind(update.tone.map(|v| v.as_str()))
        .bind(update.opening_phrase.as_deref())
        .bind(update.closing_phrase.as_deref())
        .bind(update.outbound_webhook_url.is_some())
        .bind(update.outbound_webhook_url.clone().flatten())
        .bind(update.avatar_url.is_some())
        .bind(update.avatar_url.clone().flatten())
        .bind(update.is_active)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict(format!("agent {id}"))
            } else {
                err.into()
            }
        })?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn replace_agent_avatar(
        &self,
        id: Uuid,
        avatar_url: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<String>> {
        let row = sqlx::query(
            "WITH previous AS (SELECT avatar_url FROM agents WHERE id = $1 FOR UPDATE)
             UPDATE agents SET avatar_url = $2, updated_at = $3
             WHERE id = $1
             RETURNING (SELECT avatar_url FROM previous) AS previous_avatar_url",
        )
        .bind(id)
        .bind(avatar_url)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<String>, _>("previous_avatar_url")?),
            None => Ok(None),
        }
    }

    async fn rotate_api_key(
        &self,
        id: Uuid,
        api_key: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE agents SET public_api_key = $2, updated_at = $3 WHERE id = $1")
                .bind(id)
                .bind(api_key)
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(|err| {
                    if is_unique_violation(&err) {
                        StoreError::Conflict(format!("agent {id}"))
                    } else {
                        err.into()
                    }
                })?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_integration(&self, integration: &Integration) -> StoreResult<Integration> {
        let row = sqlx::query(&format!(
            "INSERT INTO integrations (id, agent_id, service_name, credentials, is_active, connected_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (agent_id, service_name) DO UPDATE SET
                 credentials = EXCLUDED.credentials,
                 is_active = EXCLUDED.is_active,
                 updated_at = EXCLUDED.updated_at
             RETURNING {INTEGRATION_COLUMNS}"
        ))
        .bind(integration.id)
        .bind(integration.agent_id)
        .bind(integration.service_name.as_str())
        .bind(&integration.credentials)
        .bind(integration.is_active)
        .bind(integration.connected_at)
        .bind(integration.updated_at)
        .fetch_one(&self.pool)
        .await?;
        integration_from_row(&row)
    }

    async fn find_integration(
        &self,
        agent_id: Uuid,
        service: ServiceName,
    ) -> StoreResult<Option<Integration>> {
        let row = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE agent_id = $1 AND service_name = $2"
        ))
        .bind(agent_id)
        .bind(service.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(integration_from_row).transpose()
    }

    async fn list_integrations(&self, agent_id: Uuid) -> StoreResult<Vec<Integration>> {
        let rows = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE agent_id = $1 ORDER BY connected_at"
        ))
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(integration_from_row).collect()
    }

    async fn insert_knowledge_file(&self, file: &KnowledgeFile) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO knowledge_files (id, agent_id, file_name, file_url, file_type, file_size, uploaded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(file.id)
        .bind(file.agent_id)
        .bind(&file.file_name)
        .bind(&file.file_url)
        .bind(file.file_type.as_str())
        .bind(file.file_size)
        .bind(file.uploaded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_knowledge_files(&self, agent_id: Uuid) -> StoreResult<Vec<KnowledgeFile>> {
        let rows = sqlx::query(&format!(
            "SELECT {KNOWLEDGE_COLUMNS} FROM knowledge_files WHERE agent_id = $1 ORDER BY uploaded_at DESC"
        ))
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(knowledge_from_row).collect()
    }

    async fn find_knowledge_file(
        &self,
        agent_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<KnowledgeFile>> {
        let row = sqlx::query(&format!(
            "SELECT {KNOWLEDGE_COLUMNS} FROM knowledge_files WHERE agent_id = $1 AND id = $2"
        ))
        .bind(agent_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(knowledge_from_row).transpose()
    }

    async fn delete_knowledge_file(&self, agent_id: Uuid, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM knowledge_files WHERE agent_id = $1 AND id = $2")
            .bind(agent_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_open_conversation(
        &self,
        agent_id: Uuid,
        customer_identifier: &str,
    ) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c
             WHERE c.agent_id = $1 AND c.customer_identifier = $2 AND c.status <> 'closed'"
        ))
        .bind(agent_id)
        .bind(customer_identifier)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO conversations (id, agent_id, customer_identifier, status, channel,
                 last_activity_at, satisfaction_rating, tags, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (agent_id, customer_identifier) WHERE status <> 'closed' DO NOTHING",
        )
        .bind(conversation.id)
        .bind(conversation.agent_id)
        .bind(&conversation.customer_identifier)
        .bind(conversation.status.as_str())
        .bind(conversation.channel.as_str())
        .bind(conversation.last_activity_at)
        .bind(conversation.satisfaction_rating)
        .bind(Json(&conversation.tags))
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                StoreError::ForeignKey(format!("agent {}", conversation.agent_id))
            } else {
                err.into()
            }
        })?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_conversation(
        &self,
        agent_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.agent_id = $1 AND c.id = $2"
        ))
        .bind(agent_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn list_conversations(
        &self,
        agent_id: Uuid,
        filter: &ConversationFilter,
    ) -> StoreResult<Page<ConversationSummary>> {
        let pattern = filter.search.as_deref().map(like_pattern);
        let status = filter.status.map(|status| status.as_str());
        let channel = filter.channel.map(|channel| channel.as_str());
        let predicate = "c.agent_id = $1
             AND ($2::text IS NULL OR c.customer_identifier ILIKE $2 ESCAPE '\\')
             AND ($3::text IS NULL OR c.status = $3)
             AND ($4::text IS NULL OR c.channel = $4)";

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM conversations c WHERE {predicate}"
        ))
        .bind(agent_id)
        .bind(&pattern)
        .bind(status)
        .bind(channel)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS},
                 m.id AS m_id, m.sender AS m_sender, m.content AS m_content,
                 m.metadata AS m_metadata, m.created_at AS m_created_at
             FROM conversations c
             LEFT JOIN LATERAL (
                 SELECT id, sender, content, metadata, created_at FROM messages
                 WHERE conversation_id = c.id
                 ORDER BY created_at DESC, seq DESC
                 LIMIT 1
             ) m ON TRUE
             WHERE {predicate}
             ORDER BY c.last_activity_at DESC, c.id
             LIMIT $5 OFFSET $6"
        ))
        .bind(agent_id)
        .bind(&pattern)
        .bind(status)
        .bind(channel)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(|row| {
                let conversation = conversation_from_row(row)?;
                let last_message = last_message_from_row(row, conversation.id)?;
                Ok(ConversationSummary {
                    conversation,
                    last_message,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Page { items, total })
    }

    async fn update_conversation(
        &self,
        agent_id: Uuid,
        id: Uuid,
        patch: &ConversationPatch,
    ) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "UPDATE conversations c SET
                 status = COALESCE($3, c.status),
                 satisfaction_rating = COALESCE($4, c.satisfaction_rating),
                 tags = COALESCE($5::jsonb, c.tags),
                 updated_at = NOW()
             WHERE c.agent_id = $1 AND c.id = $2
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(agent_id)
        .bind(id)
        .bind(patch.status.map(|status| status.as_str()))
        .bind(patch.satisfaction_rating)
        .bind(patch.tags.as_ref().map(Json))
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict(format!(
                    "another conversation with the same customer is already open ({id})"
                ))
            } else {
                err.into()
            }
        })?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn touch_conversation(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "UPDATE conversations c SET
                 last_activity_at = GREATEST(c.last_activity_at, $2),
                 status = CASE WHEN c.status IN ('pending_ai', 'pending_human') THEN 'open' ELSE c.status END,
                 updated_at = NOW()
             WHERE c.id = $1
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender, content, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.sender.as_str())
        .bind(&message.content)
        .bind(&message.metadata)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                StoreError::ForeignKey(format!("conversation {}", message.conversation_id))
            } else {
                err.into()
            }
        })?;
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Page<Message>> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?;
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1
             ORDER BY created_at, seq LIMIT $2 OFFSET $3"
        ))
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let items = rows.iter().map(message_from_row).collect::<StoreResult<_>>()?;
        Ok(Page { items, total })
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1
             ORDER BY created_at DESC, seq DESC LIMIT $2"
        ))
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}
