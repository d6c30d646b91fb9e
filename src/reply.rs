use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    config::OpenAiConfig,
    prompting::{render_reply_line, render_system_prompt, SystemPromptContext},
    types::{Conversation, Formality, Language, Message, Mood, Persona, ResponseSpeed, Sender},
};

/// Confidence recorded on the degraded reply.
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    Help,
    Goodbye,
    Default,
    Generated,
    Error,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::Help => "help",
            Intent::Goodbye => "goodbye",
            Intent::Default => "default",
            Intent::Generated => "generated",
            Intent::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("reply service returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("reply service returned no content")]
    Empty,
}

/// Everything a generator may look at for one inbound message.
pub struct ReplyRequest<'a> {
    pub content: &'a str,
    pub agent_name: &'a str,
    pub persona: &'a Persona,
    pub conversation: &'a Conversation,
    /// Recent messages, oldest first, including the inbound one.
    pub history: &'a [Message],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplyDraft {
    pub content: String,
    pub confidence: f64,
    pub intent: Intent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedReply {
    pub content: String,
    pub confidence: f64,
    pub intent: Intent,
    pub processing_time_ms: u64,
    pub degraded: bool,
}

impl GeneratedReply {
    pub fn from_draft(draft: ReplyDraft, processing_time_ms: u64) -> Self {
        Self {
            content: draft.content,
            confidence: draft.confidence,
            intent: draft.intent,
            processing_time_ms,
            degraded: false,
        }
    }

    pub fn degraded(language: Language, processing_time_ms: u64) -> Self {
        Self {
            content: language.fallback_reply().to_string(),
            confidence: FALLBACK_CONFIDENCE,
            intent: Intent::Error,
            processing_time_ms,
            degraded: true,
        }
    }

    pub fn metadata(&self) -> Value {
        let mut metadata = json!({
            "confidence": self.confidence,
            "intent": self.intent.as_str(),
            "processing_time": self.processing_time_ms,
        });
        if self.degraded {
            metadata["degraded"] = json!(true);
        }
        metadata
    }
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, request: &ReplyRequest<'_>) -> Result<ReplyDraft, ReplyError>;
}

const EMOJIS: [&str; 5] = ["😊", "👍", "🙂", "✨", "💡"];

fn canned_lines(language: Language, intent: Intent) -> &'static [&'static str] {
    match (language, intent) {
        (Language::Pt, Intent::Greeting) => &[
            "Olá! Como posso ajudar você hoje?",
            "Oi! Em que posso ser útil?",
            "Bem-vindo! Aqui é {{ agent_name }}. Como posso te auxiliar?",
        ],
        (Language::Pt, Intent::Help) => &[
            "Estou aqui para ajudar! Pode me contar mais sobre sua dúvida?",
            "Claro, vou te ajudar com isso. Me dê mais detalhes.",
            "Ficaria feliz em ajudar! Qual é sua questão?",
        ],
        (Language::Pt, Intent::Goodbye) => &[
            "Foi um prazer ajudar! Tenha um ótimo dia!",
            "Espero ter ajudado. Até logo!",
            "Obrigado pela conversa. Volte sempre!",
        ],
        (Language::Pt, _) => &[
            "Entendi sua mensagem. Deixe-me ver como posso ajudar.",
            "Interessante. Pode me dar mais informações sobre isso?",
            "Obrigado por compartilhar isso comigo. Como posso te ajudar?",
        ],
        (Language::En, Intent::Greeting) => &[
            "Hello! How can I help you today?",
            "Hi! What can I do for you?",
            "Welcome! This is {{ agent_name }}. How can I assist you?",
        ],
        (Language::En, Intent::Help) => &[
            "I'm here to help! Can you tell me more about your question?",
            "Sure, I'll help you with that. Give me a few more details.",
            "Happy to help! What is your question?",
        ],
        (Language::En, Intent::Goodbye) => &[
            "It was a pleasure to help! Have a great day!",
            "I hope I helped. See you soon!",
            "Thanks for the chat. Come back anytime!",
        ],
        (Language::En, _) => &[
            "Got your message. Let me see how I can help.",
            "Interesting. Can you give me more information about that?",
            "Thanks for sharing that with me. How can I help you?",
        ],
        (Language::Es, Intent::Greeting) => &[
            "¡Hola! ¿Cómo puedo ayudarte hoy?",
            "¡Hola! ¿En qué puedo serte útil?",
            "¡Bienvenido! Soy {{ agent_name }}. ¿Cómo puedo asistirte?",
        ],
        (Language::Es, Intent::Help) => &[
            "¡Estoy aquí para ayudar! ¿Puedes contarme más sobre tu duda?",
            "Claro, te ayudo con eso. Dame más detalles.",
            "¡Con gusto te ayudo! ¿Cuál es tu pregunta?",
        ],
        (Language::Es, Intent::Goodbye) => &[
            "¡Fue un placer ayudar! ¡Que tengas un gran día!",
            "Espero haberte ayudado. ¡Hasta luego!",
            "Gracias por la conversación. ¡Vuelve cuando quieras!",
        ],
        (Language::Es, _) => &[
            "Entendí tu mensaje. Déjame ver cómo puedo ayudar.",
            "Interesante. ¿Puedes darme más información sobre eso?",
            "Gracias por compartir eso conmigo. ¿Cómo puedo ayudarte?",
        ],
    }
}

const GREETING_WORDS: &[&str] = &[
    "olá", "ola", "oi", "hello", "hi", "hey", "hola", "bom dia", "boa tarde", "boa noite",
    "good morning", "buenos días", "buenos dias", "buenas tardes",
];
const HELP_WORDS: &[&str] = &["ajuda", "help", "ayuda", "socorro", "suporte", "support"];
const GOODBYE_WORDS: &[&str] = &[
    "tchau", "obrigado", "obrigada", "valeu", "bye", "goodbye", "thanks", "thank you", "adiós",
    "adios", "gracias", "chao",
];

/// Matches whole words or multi-word phrases, so "oi" does not fire on "boi".
fn mentions(normalized: &str, words: &[&str]) -> bool {
    words.iter().any(|word| {
        normalized
            .match_indices(word)
            .any(|(start, matched)| {
                let end = start + matched.len();
                let before = normalized[..start].chars().next_back();
                let after = normalized[end..].chars().next();
                !before.is_some_and(char::is_alphanumeric)
                    && !after.is_some_and(char::is_alphanumeric)
            })
    })
}

pub fn detect_intent(content: &str) -> Intent {
    let normalized = content.to_lowercase();
    if mentions(&normalized, GREETING_WORDS) {
        Intent::Greeting
    } else if mentions(&normalized, HELP_WORDS) || normalized.contains('?') {
        Intent::Help
    } else if mentions(&normalized, GOODBYE_WORDS) {
        Intent::Goodbye
    } else {
        Intent::Default
    }
}

fn personalize(mut text: String, persona: &Persona, seed: &[u8]) -> String {
    if persona.mood == Mood::Formal {
        let mut collapsed = String::with_capacity(text.len());
        let mut previous_bang = false;
        for ch in text.chars() {
            if ch == '!' {
                if !previous_bang {
                    collapsed.push('.');
                }
                previous_bang = true;
            } else {
                collapsed.push(ch);
                previous_bang = false;
            }
        }
        text = collapsed.replace('¡', "");
        if let Some(rest) = text.strip_prefix("Oi") {
            text = format!("Olá{rest}");
        } else if let Some(rest) = text.strip_prefix("Hi") {
            text = format!("Hello{rest}");
        }
    }
    if persona.formality == Formality::Formal && persona.language == Language::Pt {
        text = text.replace("você", "o senhor/a senhora");
    }
    if persona.allow_emojis && seed[1] % 2 == 1 {
        let emoji = EMOJIS[seed[2] as usize % EMOJIS.len()];
        text.push(' ');
        text.push_str(emoji);
    }
    text
}

/// Keyword-driven replies in the agent's language. Variant, emoji and
/// confidence are derived from a hash of the conversation and message, so
/// the same input always yields the same reply.
#[derive(Debug, Default, Clone)]
pub struct CannedReplyGenerator;

impl CannedReplyGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn draft(&self, request: &ReplyRequest<'_>) -> ReplyDraft {
        let persona = request.persona;
        let intent = detect_intent(request.content);
        let seed = Sha256::new()
            .chain_update(request.conversation.id.as_bytes())
            .chain_update(request.content.as_bytes())
            .finalize();

        let has_replied = request
            .history
            .iter()
            .any(|message| message.sender != Sender::Customer);
        let opening = persona.opening_phrase.trim();
        let closing = persona.closing_phrase.trim();

        let line = match intent {
            Intent::Greeting if !has_replied && !opening.is_empty() => opening.to_string(),
            Intent::Goodbye if !closing.is_empty() => closing.to_string(),
            _ => {
                let lines = canned_lines(persona.language, intent);
                lines[seed[0] as usize % lines.len()].to_string()
            }
        };
        let content = personalize(
            render_reply_line(&line, request.agent_name),
            persona,
            &seed,
        );

        ReplyDraft {
            content,
            confidence: 0.70 + f64::from(seed[3] % 30) / 100.0,
            intent,
        }
    }
}

#[async_trait]
impl ReplyGenerator for CannedReplyGenerator {
    async fn generate(&self, request: &ReplyRequest<'_>) -> Result<ReplyDraft, ReplyError> {
        Ok(self.draft(request))
    }
}

/// Chat-completions backed generator for deployments with an API key.
pub struct OpenAiReplyGenerator {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiReplyGenerator {
    pub fn new(client: reqwest::Client, config: OpenAiConfig) -> Self {
        Self { client, config }
    }

    fn max_tokens(speed: ResponseSpeed) -> u32 {
        match speed {
            ResponseSpeed::Fast => 150,
            ResponseSpeed::Balanced => 300,
            ResponseSpeed::Detailed => 600,
        }
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiReplyGenerator {
    async fn generate(&self, request: &ReplyRequest<'_>) -> Result<ReplyDraft, ReplyError> {
        let system = render_system_prompt(&SystemPromptContext {
            agent_name: request.agent_name,
            persona: request.persona,
        });
        let mut messages = vec![json!({ "role": "system", "content": system })];
        messages.extend(request.history.iter().map(|message| {
            let role = match message.sender {
                Sender::Customer => "user",
                Sender::Ai | Sender::User => "assistant",
            };
            json!({ "role": role, "content": message.content })
        }));
        let last_is_inbound = request
            .history
            .last()
            .map(|message| message.sender == Sender::Customer && message.content == request.content)
            .unwrap_or(false);
        if !last_is_inbound {
            messages.push(json!({ "role": "user", "content": request.content }));
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.model,
                "messages": messages,
                "temperature": 0.3,
                "max_tokens": Self::max_tokens(request.persona.response_speed),
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ReplyError::Upstream { status, body });
        }
        let payload = response.json::<Value>().await?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(ReplyError::Empty);
        }
        Ok(ReplyDraft {
            content: text,
            confidence: 0.9,
            intent: Intent::Generated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;
    use uuid::Uuid;

    fn conversation() -> Conversation {
        Conversation::open(Uuid::new_v4(), "c1", Channel::Web)
    }

    fn request<'a>(
        content: &'a str,
        persona: &'a Persona,
        conversation: &'a Conversation,
        history: &'a [Message],
    ) -> ReplyRequest<'a> {
        ReplyRequest {
            content,
            agent_name: "Nina",
            persona,
            conversation,
            history,
        }
    }

    #[test]
    fn intents_follow_keywords_on_word_boundaries() {
        assert_eq!(detect_intent("Oi, tudo bem"), Intent::Greeting);
        assert_eq!(detect_intent("Bom dia!"), Intent::Greeting);
        assert_eq!(detect_intent("preciso de ajuda"), Intent::Help);
        assert_eq!(detect_intent("qual o prazo?"), Intent::Help);
        assert_eq!(detect_intent("valeu, tchau"), Intent::Goodbye);
        assert_eq!(detect_intent("meu boi fugiu"), Intent::Default);
    }

    #[test]
    fn canned_replies_are_deterministic_and_confident() {
        let persona = Persona::default();
        let conversation = conversation();
        let generator = CannedReplyGenerator::new();
        let first = generator.draft(&request("preciso de ajuda", &persona, &conversation, &[]));
        let again = generator.draft(&request("preciso de ajuda", &persona, &conversation, &[]));
        assert_eq!(first, again);
        assert!((0.7..1.0).contains(&first.confidence));
        assert_eq!(first.intent, Intent::Help);
    }

    #[test]
    fn first_greeting_uses_the_opening_phrase() {
        let persona = Persona {
            allow_emojis: false,
            opening_phrase: "Bem-vindo à loja!".into(),
            ..Persona::default()
        };
        let conversation = conversation();
        let draft = CannedReplyGenerator::new().draft(&request("olá", &persona, &conversation, &[]));
        assert_eq!(draft.content, "Bem-vindo à loja!");

        let history = [Message::new(
            conversation.id,
            Sender::Ai,
            "Bem-vindo à loja!".into(),
            json!({}),
        )];
        let draft =
            CannedReplyGenerator::new().draft(&request("olá", &persona, &conversation, &history));
        assert_ne!(draft.content, "Bem-vindo à loja!");
    }

    #[test]
    fn formal_persona_drops_exclamations_and_uses_formal_address() {
        let persona = Persona {
            mood: Mood::Formal,
            formality: Formality::Formal,
            allow_emojis: false,
            ..Persona::default()
        };
        let text = personalize(
            "Oi!! Como posso ajudar você hoje?".to_string(),
            &persona,
            &[0; 32],
        );
        assert_eq!(text, "Olá. Como posso ajudar o senhor/a senhora hoje?");
    }

    #[test]
    fn degraded_reply_speaks_the_agent_language() {
        let reply = GeneratedReply::degraded(Language::En, 42);
        assert!(reply.content.starts_with("Sorry"));
        assert!(reply.confidence <= 0.2);
        assert_eq!(reply.metadata()["intent"], json!("error"));
        assert_eq!(reply.metadata()["degraded"], json!(true));
    }

    #[tokio::test]
    async fn openai_generator_reads_the_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"content":"  Posso ajudar sim.  "}}]}"#)
            .create_async()
            .await;
        let generator = OpenAiReplyGenerator::new(
            reqwest::Client::new(),
            OpenAiConfig {
                api_key: "test-key".into(),
                model: "test-model".into(),
                base_url: server.url(),
            },
        );
        let persona = Persona::default();
        let conversation = conversation();
        let draft = generator
            .generate(&request("oi", &persona, &conversation, &[]))
            .await
            .unwrap();
        assert_eq!(draft.content, "Posso ajudar sim.");
        assert_eq!(draft.intent, Intent::Generated);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn openai_generator_surfaces_upstream_failures() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;
        let generator = OpenAiReplyGenerator::new(
            reqwest::Client::new(),
            OpenAiConfig {
                api_key: "k".into(),
                model: "m".into(),
                base_url: server.url(),
            },
        );
        let persona = Persona::default();
        let conversation = conversation();
        let err = generator
            .generate(&request("oi", &persona, &conversation, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplyError::Upstream { status: 503, .. }));
    }
}
