use std::{collections::BTreeSet, str::FromStr, sync::LazyLock};

use axum::{
    extract::{FromRequest, Request},
    Json,
};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    error::{ApiError, FieldError},
    types::{
        AccountUpdateBody, AgentUpdate, Channel, ConnectIntegrationBody, ConversationPatch,
        IntegrationRequest, LoginBody, OperatorMessageBody, PasswordChangeBody,
        PatchConversationBody, PublicMessage, PublicMessageBody, RegisterBody, ServiceName,
        UpdateAgentBody, UserUpdate,
    },
};

pub const MAX_MESSAGE_CHARS: usize = 2000;
pub const MAX_PHRASE_CHARS: usize = 500;
pub const MAX_CUSTOMER_IDENTIFIER_CHARS: usize = 100;
const MAX_TAG_CHARS: usize = 50;
const MAX_TAGS: usize = 20;

static EMAIL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok());

fn is_email(value: &str) -> bool {
    EMAIL_RE
        .as_ref()
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Checks a request body and turns it into the value handlers work with.
pub trait Validate {
    type Output;

    fn validate(self) -> Result<Self::Output, Vec<FieldError>>;
}

/// JSON body extractor that rejects malformed or invalid payloads with a
/// 400 `VALIDATION_ERROR` before the handler runs.
pub struct ValidJson<T: Validate>(pub T::Output);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: Validate + DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(body) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::invalid("body", rejection.body_text()))?;
        body.validate().map(ValidJson).map_err(ApiError::Validation)
    }
}

pub fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

pub fn is_http_url(value: &str) -> bool {
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.starts_with('/') && !host.contains(char::is_whitespace))
}

fn check_len(
    errors: &mut Vec<FieldError>,
    field: &str,
    value: &str,
    min: usize,
    max: usize,
) {
    let len = value.chars().count();
    if len < min {
        errors.push(FieldError::new(
            field,
            if min == 1 {
                "must not be empty".to_string()
            } else {
                format!("must be at least {min} characters")
            },
        ));
    } else if len > max {
        errors.push(FieldError::new(
            field,
            format!("must be at most {max} characters"),
        ));
    }
}

fn parse_enum<T: FromStr<Err = String>>(
    errors: &mut Vec<FieldError>,
    field: &str,
    value: Option<String>,
) -> Option<T> {
    let raw = value?;
    match raw.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(message) => {
            errors.push(FieldError::new(field, message));
            None
        }
    }
}

fn finish<T>(errors: Vec<FieldError>, value: T) -> Result<T, Vec<FieldError>> {
    if errors.is_empty() {
        Ok(value)
    } else {
        Err(errors)
    }
}

impl Validate for RegisterBody {
    type Output = RegisterBody;

    fn validate(self) -> Result<Self::Output, Vec<FieldError>> {
        let mut errors = Vec::new();
        let name = self.name.trim().to_string();
        check_len(&mut errors, "name", &name, 2, 100);
        let email = normalize_email(&self.email);
        if !is_email(&email) {
            errors.push(FieldError::new("email", "must be a valid email"));
        }
        if self.password.chars().count() < 6 {
            errors.push(FieldError::new("password", "must be at least 6 characters"));
        }
        finish(
            errors,
            RegisterBody {
                name,
                email,
                password: self.password,
            },
        )
    }
}

impl Validate for AccountUpdateBody {
    type Output = UserUpdate;

    fn validate(self) -> Result<Self::Output, Vec<FieldError>> {
        let mut errors = Vec::new();
        let name = self.name.map(|name| name.trim().to_string());
        if let Some(name) = &name {
            check_len(&mut errors, "name", name, 2, 100);
        }
        let email = self.email.map(|email| normalize_email(&email));
        if let Some(email) = &email {
            if !is_email(email) {
                errors.push(FieldError::new("email", "must be a valid email"));
            }
        }
        finish(
            errors,
            UserUpdate {
                name,
                email,
                password_hash: None,
            },
        )
    }
}

impl Validate for PasswordChangeBody {
    type Output = PasswordChangeBody;

    fn validate(self) -> Result<Self::Output, Vec<FieldError>> {
        let mut errors = Vec::new();
        if self.current_password.is_empty() {
            errors.push(FieldError::new("current_password", "must not be empty"));
        }
        if self.new_password.chars().count() < 6 {
            errors.push(FieldError::new("new_password", "must be at least 6 characters"));
        }
        finish(errors, self)
    }
}

impl Validate for LoginBody {
    type Output = LoginBody;

    fn validate(self) -> Result<Self::Output, Vec<FieldError>> {
        let mut errors = Vec::new();
        let email = normalize_email(&self.email);
        if !is_email(&email) {
            errors.push(FieldError::new("email", "must be a valid email"));
        }
        if self.password.is_empty() {
            errors.push(FieldError::new("password", "must not be empty"));
        }
        finish(
            errors,
            LoginBody {
                email,
                password: self.password,
            },
        )
    }
}

/// Empty string means "clear"; anything else must be an http(s) URL.
fn optional_url(
    errors: &mut Vec<FieldError>,
    field: &str,
    value: Option<String>,
    require_http: bool,
) -> Option<Option<String>> {
    let raw = value?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(None);
    }
    if require_http && !is_http_url(trimmed) {
        errors.push(FieldError::new(field, "must be an http or https URL"));
        return None;
    }
    Some(Some(trimmed.to_string()))
}

impl Validate for UpdateAgentBody {
    type Output = AgentUpdate;

    fn validate(self) -> Result<Self::Output, Vec<FieldError>> {
        let mut errors = Vec::new();
        let name = self.name.map(|name| name.trim().to_string());
        if let Some(name) = &name {
            check_len(&mut errors, "name", name, 2, 100);
        }
        for (field, phrase) in [
            ("opening_phrase", &self.opening_phrase),
            ("closing_phrase", &self.closing_phrase),
        ] {
            if let Some(phrase) = phrase {
                check_len(&mut errors, field, phrase, 0, MAX_PHRASE_CHARS);
            }
        }
        let update = AgentUpdate {
            name,
            language: parse_enum(&mut errors, "language", self.language),
            mood: parse_enum(&mut errors, "mood", self.mood),
            formality: parse_enum(&mut errors, "formality", self.formality),
            allow_emojis: self.allow_emojis,
            response_speed: parse_enum(&mut errors, "response_speed", self.response_speed),
            tone: parse_enum(&mut errors, "tone", self.tone),
            opening_phrase: self.opening_phrase,
            closing_phrase: self.closing_phrase,
            outbound_webhook_url: optional_url(
                &mut errors,
                "outbound_webhook_url",
                self.outbound_webhook_url,
                true,
            ),
            avatar_url: optional_url(&mut errors, "avatar_url", self.avatar_url, false),
            is_active: None,
        };
        finish(errors, update)
    }
}

fn required_str(errors: &mut Vec<FieldError>, credentials: &Value, key: &str) {
    match credentials.get(key) {
        Some(Value::String(value)) if !value.trim().is_empty() => {}
        _ => errors.push(FieldError::new(
            &format!("credentials.{key}"),
            "is required",
        )),
    }
}

fn optional_str(errors: &mut Vec<FieldError>, credentials: &Value, key: &str) {
    match credentials.get(key) {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(_) => errors.push(FieldError::new(
            &format!("credentials.{key}"),
            "must be a string",
        )),
    }
}

impl Validate for ConnectIntegrationBody {
    type Output = IntegrationRequest;

    fn validate(self) -> Result<Self::Output, Vec<FieldError>> {
        let mut errors = Vec::new();
        let service = parse_enum::<ServiceName>(&mut errors, "service", Some(self.service));
        if !self.credentials.is_object() {
            errors.push(FieldError::new("credentials", "must be an object"));
            return Err(errors);
        }
        let credentials = self.credentials;
        match service {
            Some(ServiceName::Whatsapp) => {
                required_str(&mut errors, &credentials, "token");
                optional_str(&mut errors, &credentials, "phone_number_id");
                optional_str(&mut errors, &credentials, "app_secret");
            }
            Some(ServiceName::Telegram) => required_str(&mut errors, &credentials, "bot_token"),
            Some(ServiceName::Twilio) => {
                required_str(&mut errors, &credentials, "account_sid");
                required_str(&mut errors, &credentials, "auth_token");
                optional_str(&mut errors, &credentials, "phone_number");
            }
            Some(ServiceName::OutboundWebhook) => match credentials.get("url") {
                Some(Value::String(url)) if is_http_url(url.trim()) => {}
                _ => errors.push(FieldError::new(
                    "credentials.url",
                    "must be an http or https URL",
                )),
            },
            None => {}
        }
        match service {
            Some(service) if errors.is_empty() => Ok(IntegrationRequest {
                service,
                credentials,
            }),
            _ => Err(errors),
        }
    }
}

impl Validate for OperatorMessageBody {
    type Output = String;

    fn validate(self) -> Result<Self::Output, Vec<FieldError>> {
        let mut errors = Vec::new();
        let content = self.content.trim().to_string();
        check_len(&mut errors, "content", &content, 1, MAX_MESSAGE_CHARS);
        finish(errors, content)
    }
}

impl Validate for PatchConversationBody {
    type Output = ConversationPatch;

    fn validate(self) -> Result<Self::Output, Vec<FieldError>> {
        let mut errors = Vec::new();
        let status = parse_enum(&mut errors, "status", self.status);
        let satisfaction_rating = match self.satisfaction_rating {
            Some(rating @ 1..=5) => Some(rating as i16),
            Some(_) => {
                errors.push(FieldError::new(
                    "satisfaction_rating",
                    "must be between 1 and 5",
                ));
                None
            }
            None => None,
        };
        let tags = self.tags.map(|tags| {
            let mut seen = BTreeSet::new();
            let mut unique = Vec::new();
            for tag in tags {
                let tag = tag.trim().to_string();
                if tag.is_empty() || tag.chars().count() > MAX_TAG_CHARS {
                    errors.push(FieldError::new(
                        "tags",
                        format!("each tag must be 1 to {MAX_TAG_CHARS} characters"),
                    ));
                    continue;
                }
                if seen.insert(tag.clone()) {
                    unique.push(tag);
                }
            }
            if unique.len() > MAX_TAGS {
                errors.push(FieldError::new(
                    "tags",
                    format!("at most {MAX_TAGS} tags are allowed"),
                ));
            }
            unique
        });
        finish(
            errors,
            ConversationPatch {
                status,
                satisfaction_rating,
                tags,
            },
        )
    }
}

impl Validate for PublicMessageBody {
    type Output = PublicMessage;

    fn validate(self) -> Result<Self::Output, Vec<FieldError>> {
        let mut errors = Vec::new();
        check_len(&mut errors, "message", self.message.trim(), 1, MAX_MESSAGE_CHARS);
        let channel = parse_enum(&mut errors, "channel", self.channel).unwrap_or(Channel::Api);
        let customer_identifier = self
            .customer_identifier
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        if let Some(id) = &customer_identifier {
            check_len(
                &mut errors,
                "customer_identifier",
                id,
                1,
                MAX_CUSTOMER_IDENTIFIER_CHARS,
            );
        }
        finish(
            errors,
            PublicMessage {
                message: self.message.trim().to_string(),
                channel,
                customer_identifier,
            },
        )
    }
}
