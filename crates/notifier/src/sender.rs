//! Message sender boundary and the Telegram Bot API implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

pub use herald_engine::SendOutcome;

/// Outbound call to the chat endpoint.
///
/// Implementations report transport trouble as `RetryableFailure` unless the
/// endpoint said outright that the request can never succeed.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, destination: &str, payload: &str) -> SendOutcome;
}

/// Error envelope returned by the Bot API on non-2xx responses.
#[derive(Debug, Deserialize)]
struct TelegramResponse {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<TelegramParameters>,
}

#[derive(Debug, Deserialize)]
struct TelegramParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Sends messages through `POST /bot<token>/sendMessage`.
pub struct TelegramSender {
    client: reqwest::Client,
    endpoint: String,
}

impl TelegramSender {
    pub fn new(api_url: &str, bot_token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/bot{}/sendMessage", api_url.trim_end_matches('/'), bot_token),
        })
    }

    /// Map a non-success HTTP status onto retryable vs permanent.
    pub fn classify(status: StatusCode, description: Option<&str>) -> SendOutcome {
        let reason = match description {
            Some(desc) => format!("telegram returned {}: {}", status.as_u16(), desc),
            None => format!("telegram returned {}", status.as_u16()),
        };

        if status.is_success() {
            SendOutcome::Success
        } else if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            SendOutcome::RetryableFailure(reason)
        } else if status.is_client_error() {
            // Unknown chat, bot blocked, message too long...
            SendOutcome::PermanentFailure(reason)
        } else {
            SendOutcome::RetryableFailure(reason)
        }
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send(&self, destination: &str, payload: &str) -> SendOutcome {
        let body = json!({
            "chat_id": destination,
            "text": payload,
        });

        let response = match self.client.post(&self.endpoint).json(&body).send().await {
            Ok(response) => response,
            // The URL carries the bot token; keep it out of task records and logs.
            Err(e) => return SendOutcome::RetryableFailure(format!("transport error: {}", e.without_url())),
        };

        let status = response.status();
        if status.is_success() {
            return SendOutcome::Success;
        }

        let parsed = response.json::<TelegramResponse>().await.ok();
        let retry_after = parsed
            .as_ref()
            .and_then(|r| r.parameters.as_ref())
            .and_then(|p| p.retry_after);
        if let Some(secs) = retry_after {
            tracing::warn!(destination, retry_after_secs = secs, "Telegram rate limit hit");
        }

        Self::classify(status, parsed.as_ref().and_then(|r| r.description.as_deref()))
    }
}
