use crate::framing::{Frame, LineSplitter, parse_line, payload_delta};
use crate::protocol::{ChatRequest, ErrorBody, ErrorCode, Message};
use crate::server::RELAY_PATH;
use futures::{Stream, StreamExt};
use reqwest::Client as HttpClient;
use thiserror::Error;

pub struct ClientConfig {
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("rate limited by the relay")]
    RateLimited,

    #[error("completion credits exhausted")]
    CreditsExhausted,

    #[error("relay responded with {status}")]
    Status {
        status: u16,
        code: Option<ErrorCode>,
    },

    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request cancelled")]
    Cancelled,
}

/// Short user-facing explanation of a failed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    RateLimited,
    CreditsExhausted,
    LoginRequired,
    Failed,
}

impl Notice {
    pub fn text(self) -> &'static str {
        match self {
            Notice::RateLimited => "Rate limit exceeded. Please try again later.",
            Notice::CreditsExhausted => "AI credits exhausted. Please add credits to continue.",
            Notice::LoginRequired => "Please log in to use AI Coach",
            Notice::Failed => "Failed to get AI response",
        }
    }
}

impl From<&ChatError> for Notice {
    fn from(err: &ChatError) -> Self {
        match err {
            ChatError::RateLimited => Notice::RateLimited,
            ChatError::CreditsExhausted => Notice::CreditsExhausted,
            _ => Notice::Failed,
        }
    }
}

/// How a read loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Done,
    Eof,
}

pub struct CoachClient {
    endpoint: String,
    token: String,
    http: HttpClient,
}

impl CoachClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            endpoint: format!("{}{}", normalize_base_url(&config.base_url), RELAY_PATH),
            token: config.token,
            http: HttpClient::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends the conversation and returns the response once headers arrive.
    /// The body is left unread for [`read_deltas`].
    pub async fn open(&self, messages: &[Message]) -> Result<reqwest::Response, ChatError> {
        let request = ChatRequest {
            messages: messages.to_vec(),
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status.as_u16() {
            429 => Err(ChatError::RateLimited),
            402 => Err(ChatError::CreditsExhausted),
            status => {
                let code = response.json::<ErrorBody>().await.ok().map(|body| body.code);
                tracing::debug!(status, ?code, "relay rejected chat request");
                Err(ChatError::Status { status, code })
            }
        }
    }
}

/// Reads an event stream to completion, calling `on_delta` with each text
/// fragment in wire order. Stops at the end of input or at the `[DONE]`
/// frame, whichever comes first.
pub async fn read_deltas<S, B, E, F>(stream: S, mut on_delta: F) -> Result<StreamEnd, E>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    F: FnMut(&str),
{
    let mut stream = std::pin::pin!(stream);
    let mut splitter = LineSplitter::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        splitter.push(chunk.as_ref());

        for line in splitter.lines() {
            match parse_line(&line) {
                Frame::Ignored => {}
                Frame::Done => return Ok(StreamEnd::Done),
                Frame::Data(payload) => {
                    if let Some(delta) = payload_delta(payload) {
                        on_delta(&delta);
                    }
                }
            }
        }
    }

    splitter.finish();
    Ok(StreamEnd::Eof)
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
