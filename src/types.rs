use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    config::Config,
    crypto::CredentialCipher,
    realtime::RealtimeHub,
    reply::ReplyGenerator,
    storage::FileStorage,
    store::Store,
    webhook::WebhookSender,
};

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        "must be one of [{}], got '{}'",
                        [$($text),+].join(", "),
                        other
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// Lifecycle of a conversation. Only `Closed` releases the
    /// (agent, customer) slot for a new conversation.
    ConversationStatus {
        Open => "open",
        Closed => "closed",
        PendingAi => "pending_ai",
        PendingHuman => "pending_human",
    }
);

text_enum!(Channel {
    Web => "web",
    Whatsapp => "whatsapp",
    Telegram => "telegram",
    Sms => "sms",
    Api => "api",
});

text_enum!(
    /// `User` is a human operator replying from the dashboard.
    Sender {
        Ai => "ai",
        Customer => "customer",
        User => "user",
    }
);

text_enum!(ServiceName {
    Whatsapp => "whatsapp",
    Telegram => "telegram",
    Twilio => "twilio",
    OutboundWebhook => "outbound_webhook",
});

text_enum!(Plan {
    Free => "free",
    Pro => "pro",
    Enterprise => "enterprise",
});

text_enum!(Language {
    Pt => "pt",
    En => "en",
    Es => "es",
});

text_enum!(Mood {
    Friendly => "friendly",
    Professional => "professional",
    Casual => "casual",
    Formal => "formal",
});

text_enum!(Formality {
    Informal => "informal",
    Formal => "formal",
    Mixed => "mixed",
});

text_enum!(ResponseSpeed {
    Fast => "fast",
    Balanced => "balanced",
    Detailed => "detailed",
});

text_enum!(Tone {
    Supportive => "supportive",
    Assertive => "assertive",
    Empathetic => "empathetic",
    Neutral => "neutral",
});

text_enum!(KnowledgeFileType {
    Pdf => "pdf",
    Txt => "txt",
    Doc => "doc",
    Docx => "docx",
});

impl ConversationStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingAi | Self::PendingHuman)
    }
}

impl Language {
    pub fn default_opening_phrase(&self) -> &'static str {
        match self {
            Language::Pt => "Olá! Sou o assistente virtual. Como posso te ajudar hoje?",
            Language::En => "Hi! I'm the virtual assistant. How can I help you today?",
            Language::Es => "¡Hola! Soy el asistente virtual. ¿Cómo puedo ayudarte hoy?",
        }
    }

    pub fn default_closing_phrase(&self) -> &'static str {
        match self {
            Language::Pt => {
                "Foi um prazer ajudar! Se precisar de mais alguma coisa, estou à disposição."
            }
            Language::En => "It was a pleasure to help! If you need anything else, I'm here.",
            Language::Es => "¡Fue un placer ayudar! Si necesitas algo más, estoy a tu disposición.",
        }
    }

    /// Customer-facing apology used when reply generation fails.
    pub fn fallback_reply(&self) -> &'static str {
        match self {
            Language::Pt => "Desculpe, ocorreu um erro ao processar sua mensagem. Tente novamente.",
            Language::En => {
                "Sorry, something went wrong while processing your message. Please try again."
            }
            Language::Es => "Lo siento, ocurrió un error al procesar tu mensaje. Inténtalo de nuevo.",
        }
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub profile_picture_url: Option<String>,
    pub plan: Plan,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(name: &str, email: &str, password_hash: String) -> Self {
        let now = now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            password_hash,
            profile_picture_url: None,
            plan: Plan::Free,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub language: Language,
    pub mood: Mood,
    pub formality: Formality,
    pub allow_emojis: bool,
    pub response_speed: ResponseSpeed,
    pub tone: Tone,
    pub opening_phrase: String,
    pub closing_phrase: String,
}

impl Default for Persona {
    fn default() -> Self {
        let language = Language::Pt;
        Self {
            language,
            mood: Mood::Friendly,
            formality: Formality::Informal,
            allow_emojis: true,
            response_speed: ResponseSpeed::Balanced,
            tone: Tone::Supportive,
            opening_phrase: language.default_opening_phrase().to_string(),
            closing_phrase: language.default_closing_phrase().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
    #[serde(flatten)]
    pub persona: Persona,
    pub public_api_key: String,
    pub ingress_webhook_path: String,
    pub outbound_webhook_url: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new_for_user(user_id: Uuid, name: String) -> Self {
        let now = now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name,
            avatar_url: None,
            persona: Persona::default(),
            public_api_key: crate::crypto::generate_api_key(),
            ingress_webhook_path: Uuid::new_v4().to_string(),
            outbound_webhook_url: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub service_name: ServiceName,
    /// Ciphertext produced by the credential cipher; never serialized out.
    #[serde(skip_serializing, default)]
    pub credentials: String,
    pub is_active: bool,
    pub connected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeFile {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub file_name: String,
    pub file_url: String,
    pub file_type: KnowledgeFileType,
    pub file_size: i64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub customer_identifier: String,
    pub status: ConversationStatus,
    pub channel: Channel,
    pub last_activity_at: DateTime<Utc>,
    pub satisfaction_rating: Option<i16>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn open(agent_id: Uuid, customer_identifier: &str, channel: Channel) -> Self {
        let now = now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            customer_identifier: customer_identifier.to_string(),
            status: ConversationStatus::Open,
            channel,
            last_activity_at: now,
            satisfaction_rating: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn update_event(&self) -> Value {
        json!({
            "id": self.id,
            "status": self.status,
            "satisfaction_rating": self.satisfaction_rating,
            "tags": self.tags,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: Sender,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(conversation_id: Uuid, sender: Sender, content: String, metadata: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender,
            content,
            metadata,
            created_at: now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub last_message: Option<Message>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub search: Option<String>,
    pub status: Option<ConversationStatus>,
    pub channel: Option<Channel>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub status: Option<ConversationStatus>,
    pub satisfaction_rating: Option<i16>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn pagination(&self, limit: i64, offset: i64) -> Value {
        json!({
            "total": self.total,
            "limit": limit,
            "offset": offset,
            "has_more": offset + limit < self.total,
        })
    }
}

/// One inbound customer message, normalized by an entry adapter.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub customer_identifier: String,
    pub content: String,
    pub channel: Channel,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct Ingested {
    pub conversation: Conversation,
    pub customer_message: Message,
    pub reply_message: Message,
}

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub replies: Arc<dyn ReplyGenerator>,
    pub cipher: Arc<dyn CredentialCipher>,
    pub files: Arc<dyn FileStorage>,
    pub realtime: RealtimeHub,
    pub webhooks: WebhookSender,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        replies: Arc<dyn ReplyGenerator>,
        cipher: Arc<dyn CredentialCipher>,
        files: Arc<dyn FileStorage>,
    ) -> Self {
        let webhooks = WebhookSender::new(reqwest::Client::new(), &config.webhook);
        Self {
            config,
            store,
            replies,
            cipher,
            files,
            realtime: RealtimeHub::new(),
            webhooks,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountUpdateBody {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordChangeBody {
    #[serde(alias = "currentPassword")]
    pub current_password: String,
    #[serde(alias = "newPassword")]
    pub new_password: String,
}

/// Account fields an operator may change; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAgentBody {
    pub name: Option<String>,
    pub language: Option<String>,
    pub mood: Option<String>,
    pub formality: Option<String>,
    pub allow_emojis: Option<bool>,
    pub response_speed: Option<String>,
    pub tone: Option<String>,
    pub opening_phrase: Option<String>,
    pub closing_phrase: Option<String>,
    pub outbound_webhook_url: Option<String>,
    pub avatar_url: Option<String>,
}

/// Partial agent settings. Only the `Some` fields are written, so concurrent
/// edits of other columns (API key, avatar) survive. `Some(None)` clears a
/// nullable column.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub language: Option<Language>,
    pub mood: Option<Mood>,
    pub formality: Option<Formality>,
    pub allow_emojis: Option<bool>,
    pub response_speed: Option<ResponseSpeed>,
    pub tone: Option<Tone>,
    pub opening_phrase: Option<String>,
    pub closing_phrase: Option<String>,
    pub outbound_webhook_url: Option<Option<String>>,
    pub avatar_url: Option<Option<String>>,
    pub is_active: Option<bool>,
}

impl AgentUpdate {
    pub fn apply(&self, agent: &mut Agent, at: DateTime<Utc>) {
        if let Some(name) = &self.name {
            agent.name = name.clone();
        }
        if let Some(language) = self.language {
            agent.persona.language = language;
        }
        if let Some(mood) = self.mood {
            agent.persona.mood = mood;
        }
        if let Some(formality) = self.formality {
            agent.persona.formality = formality;
        }
        if let Some(allow_emojis) = self.allow_emojis {
            agent.persona.allow_emojis = allow_emojis;
        }
        if let Some(speed) = self.response_speed {
            agent.persona.response_speed = speed;
        }
        if let Some(tone) = self.tone {
            agent.persona.tone = tone;
        }
        if let Some(phrase) = &self.opening_phrase {
            agent.persona.opening_phrase = phrase.clone();
        }
        if let Some(phrase) = &self.closing_phrase {
            agent.persona.closing_phrase = phrase.clone();
        }
        if let Some(url) = &self.outbound_webhook_url {
            agent.outbound_webhook_url = url.clone();
        }
        if let Some(url) = &self.avatar_url {
            agent.avatar_url = url.clone();
        }
        if let Some(is_active) = self.is_active {
            agent.is_active = is_active;
        }
        agent.updated_at = at;
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectIntegrationBody {
    pub service: String,
    #[serde(default)]
    pub credentials: Value,
}

#[derive(Debug, Clone)]
pub struct IntegrationRequest {
    pub service: ServiceName,
    pub credentials: Value,
}

#[derive(Debug, Deserialize)]
pub struct OperatorMessageBody {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct PatchConversationBody {
    pub status: Option<String>,
    pub satisfaction_rating: Option<i64>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct PublicMessageBody {
    pub message: String,
    pub channel: Option<String>,
    pub customer_identifier: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PublicMessage {
    pub message: String,
    pub channel: Channel,
    pub customer_identifier: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListConversationsQuery {
    pub search: Option<String>,
    pub status: Option<String>,
    pub channel: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
