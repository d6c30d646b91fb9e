use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{config::WebhookConfig, types::ServiceName};

pub const USER_AGENT: &str = "SupportDesk-Webhook/1.0";
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook delivery to {url} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider rejected webhook setup: {0}")]
    Provider(String),
    #[error("credentials are missing {0}")]
    MissingCredential(&'static str),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeliveryReport {
    pub success: bool,
    /// Last HTTP status seen, 0 when no response arrived.
    pub status: u16,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Linear backoff: the wait after failed attempt `n` is `n * base`.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base * attempt
}

/// Outbound HTTP for customer webhooks and chat-provider setup.
#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
    timeout: Duration,
    retry_base: Duration,
    max_retries: u32,
    telegram_api_base: String,
}

impl WebhookSender {
    pub fn new(client: reqwest::Client, config: &WebhookConfig) -> Self {
        Self {
            client,
            timeout: config.timeout,
            retry_base: config.retry_base,
            max_retries: config.max_retries,
            telegram_api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_telegram_api_base(mut self, base: impl Into<String>) -> Self {
        self.telegram_api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// POSTs `payload` to `url`, retrying non-2xx and transport failures up
    /// to `max_retries` times. Attempts of one delivery run sequentially.
    pub async fn send(&self, url: &str, payload: &Value) -> DeliveryReport {
        let max_attempts = self.max_retries + 1;
        let mut status = 0u16;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let result = self
                .client
                .post(url)
                .timeout(self.timeout)
                .header("Content-Type", "application/json")
                .header("User-Agent", USER_AGENT)
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(url, attempt, status = %response.status(), "webhook delivered");
                    return DeliveryReport {
                        success: true,
                        status: response.status().as_u16(),
                        attempts: attempt,
                        error: None,
                    };
                }
                Ok(response) => {
                    status = response.status().as_u16();
                    last_error = format!("endpoint returned {}", response.status());
                    tracing::warn!(url, attempt, status, "webhook delivery failed with non-2xx status");
                }
                Err(err) => {
                    status = err.status().map(|s| s.as_u16()).unwrap_or(0);
                    last_error = err.to_string();
                    tracing::warn!(url, attempt, error = %err, "webhook delivery request failed");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(retry_delay(self.retry_base, attempt)).await;
            }
        }

        DeliveryReport {
            success: false,
            status,
            attempts: max_attempts,
            error: Some(last_error),
        }
    }

    /// Like [`send`](Self::send) but turns an exhausted delivery into an error.
    pub async fn deliver(&self, url: &str, payload: &Value) -> Result<DeliveryReport, WebhookError> {
        let report = self.send(url, payload).await;
        if report.success {
            Ok(report)
        } else {
            Err(WebhookError::Exhausted {
                url: url.to_string(),
                attempts: report.attempts,
                last_error: report.error.unwrap_or_default(),
            })
        }
    }

    pub async fn test_connection(&self, url: &str) -> Value {
        let payload = json!({
            "test": true,
            "message": "Support desk webhook connection test",
            "timestamp": crate::types::now(),
        });
        let report = self.send(url, &payload).await;
        json!({
            "success": report.success,
            "status": report.status,
            "attempts": report.attempts,
            "message": if report.success { "Connection succeeded" } else { "Connection failed" },
        })
    }

    /// Points the chat provider at our ingress URL where the provider has an
    /// API for it. WhatsApp is configured by hand in the Meta console, so it
    /// only gets the values to paste.
    pub async fn configure_provider(
        &self,
        service: ServiceName,
        credentials: &Value,
        ingress_url: &str,
        verify_token: &str,
    ) -> Result<Option<Value>, WebhookError> {
        match service {
            ServiceName::Whatsapp => Ok(Some(json!({
                "webhook_url": ingress_url,
                "verify_token": verify_token,
            }))),
            ServiceName::Telegram => {
                let bot_token = credentials
                    .get("bot_token")
                    .and_then(Value::as_str)
                    .ok_or(WebhookError::MissingCredential("bot_token"))?;
                let response = self
                    .client
                    .post(format!(
                        "{}/bot{bot_token}/setWebhook",
                        self.telegram_api_base
                    ))
                    .timeout(self.timeout)
                    .json(&json!({ "url": ingress_url }))
                    .send()
                    .await?;
                let status = response.status();
                let body = response.json::<Value>().await.unwrap_or(Value::Null);
                if !status.is_success() || body.get("ok") != Some(&Value::Bool(true)) {
                    return Err(WebhookError::Provider(format!("telegram returned {status}: {body}")));
                }
                Ok(Some(json!({
                    "webhook_url": ingress_url,
                    "telegram_response": body,
                })))
            }
            ServiceName::Twilio | ServiceName::OutboundWebhook => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(retry_base_ms: u64) -> WebhookSender {
        WebhookSender::new(
            reqwest::Client::new(),
            &WebhookConfig {
                timeout: Duration::from_secs(2),
                retry_base: Duration::from_millis(retry_base_ms),
                max_retries: 3,
            },
        )
    }

    #[test]
    fn retry_delays_grow_linearly() {
        let base = Duration::from_secs(1);
        let delays = (1..=3).map(|n| retry_delay(base, n)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3)
            ]
        );
        assert!(delays.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn failing_endpoint_gets_three_retries_then_is_abandoned() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("user-agent", USER_AGENT)
            .with_status(500)
            .expect(4)
            .create_async()
            .await;

        let started = std::time::Instant::now();
        let report = sender(10)
            .send(&format!("{}/hook", server.url()), &json!({ "x": 1 }))
            .await;
        assert!(!report.success);
        assert_eq!(report.attempts, 4);
        assert_eq!(report.status, 500);
        assert!(started.elapsed() >= Duration::from_millis(60));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn recovering_endpoint_stops_retrying() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("POST", "/hook")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let report = sender(10)
            .deliver(&format!("{}/hook", server.url()), &json!({}))
            .await
            .unwrap();
        assert_eq!(report.attempts, 1);
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn exhausted_delivery_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/hook")
            .with_status(404)
            .create_async()
            .await;
        let err = sender(1)
            .deliver(&format!("{}/hook", server.url()), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Exhausted { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn telegram_setup_registers_the_ingress_url() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/bot123:abc/setWebhook")
            .match_body(mockito::Matcher::Json(
                json!({ "url": "https://desk.example.com/webhook/ingress/p1" }),
            ))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":true}"#)
            .create_async()
            .await;

        let result = sender(1)
            .with_telegram_api_base(server.url())
            .configure_provider(
                ServiceName::Telegram,
                &json!({ "bot_token": "123:abc" }),
                "https://desk.example.com/webhook/ingress/p1",
                "p1",
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["telegram_response"]["ok"], json!(true));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn whatsapp_setup_returns_verify_data() {
        let result = sender(1)
            .configure_provider(ServiceName::Whatsapp, &json!({}), "https://x/ingress/p", "p")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["verify_token"], json!("p"));
    }
}
