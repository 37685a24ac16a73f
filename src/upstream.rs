use crate::error::RelayError;
use crate::protocol::{CompletionRequest, Message};
use reqwest::Client;

pub const DEFAULT_UPSTREAM_URL: &str = "https://ai.gateway.lovable.dev/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash";

pub const SYSTEM_PROMPT: &str = "You are an expert tennis AI coach. You provide personalized training advice, match analysis, and technique improvements.

You help with:
- Daily/weekly performance overviews
- Technique improvement suggestions
- Pre-match preparation tips
- Training plan creation
- Nutrition advice for tennis players
- Match strategy and tactics

Keep responses clear, actionable, and encouraging. Focus on practical tennis-specific advice.";

#[derive(Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
}

/// Streaming client for the completion provider.
pub struct Upstream {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    system: Message,
}

impl Upstream {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            client: Client::new(),
            url: config.url,
            model: config.model,
            api_key: config.api_key.filter(|key| !key.trim().is_empty()),
            system: Message::system(SYSTEM_PROMPT),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    /// Requests a streamed completion for `messages`, prefixed with the
    /// coaching instructions. Returns the response with its body unread.
    pub(crate) async fn stream_completion(
        &self,
        messages: &[Message],
    ) -> Result<reqwest::Response, RelayError> {
        let api_key = self.api_key.as_deref().ok_or(RelayError::MissingCredential)?;

        let request = CompletionRequest {
            model: &self.model,
            messages: std::iter::once(&self.system).chain(messages).collect(),
            stream: true,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                response = %error_text,
                "upstream completion request failed"
            );
            return Err(RelayError::UpstreamStatus(status));
        }

        tracing::debug!(messages = messages.len(), "upstream stream opened");
        Ok(response)
    }
}
