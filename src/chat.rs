//! Conversation state for one chat view.
//!
//! A turn moves `Idle -> Sending -> Streaming -> Idle`. The assistant
//! placeholder is appended when the turn starts, grows with each delta, and
//! is either kept as the final reply or removed when the turn fails.

use crate::client::{ChatError, CoachClient, Notice, StreamEnd, read_deltas};
use crate::protocol::Message;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChatState {
    #[default]
    Idle,
    Sending {
        placeholder: usize,
    },
    Streaming {
        placeholder: usize,
        accumulator: String,
    },
}

impl ChatState {
    fn name(&self) -> &'static str {
        match self {
            ChatState::Idle => "idle",
            ChatState::Sending { .. } => "sending",
            ChatState::Streaming { .. } => "streaming",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitRejected {
    #[error("message is empty")]
    Empty,
    #[error("a reply is still in progress")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {action} while {state}")]
pub struct InvalidTransition {
    action: &'static str,
    state: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed(StreamEnd),
    Failed(Notice),
}

#[derive(Debug, Default)]
pub struct ChatSession {
    conversation: Vec<Message>,
    state: ChatState,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn messages(&self) -> &[Message] {
        &self.conversation
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self.state, ChatState::Idle)
    }

    /// The assistant message currently being written, if any.
    pub fn pending_reply(&self) -> Option<&Message> {
        match self.state {
            ChatState::Idle => None,
            ChatState::Sending { placeholder } | ChatState::Streaming { placeholder, .. } => {
                self.conversation.get(placeholder)
            }
        }
    }

    /// Starts a turn: records the user message and an empty assistant
    /// placeholder, and returns the conversation to send (which ends with
    /// the new user message and excludes the placeholder).
    pub fn submit(&mut self, text: &str) -> Result<Vec<Message>, SubmitRejected> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SubmitRejected::Empty);
        }
        if self.is_busy() {
            return Err(SubmitRejected::Busy);
        }

        self.conversation.push(Message::user(text));
        let payload = self.conversation.clone();

        self.conversation.push(Message::assistant(""));
        self.state = ChatState::Sending {
            placeholder: self.conversation.len() - 1,
        };
        Ok(payload)
    }

    pub fn begin_streaming(&mut self) -> Result<(), InvalidTransition> {
        match self.state {
            ChatState::Sending { placeholder } => {
                self.state = ChatState::Streaming {
                    placeholder,
                    accumulator: String::new(),
                };
                Ok(())
            }
            _ => Err(self.invalid("begin streaming")),
        }
    }

    pub fn apply_delta(&mut self, delta: &str) -> Result<(), InvalidTransition> {
        match &mut self.state {
            ChatState::Streaming {
                placeholder,
                accumulator,
            } => {
                accumulator.push_str(delta);
                self.conversation[*placeholder].content.clone_from(accumulator);
                Ok(())
            }
            _ => Err(self.invalid("apply a delta")),
        }
    }

    /// Ends a successful turn. The placeholder keeps whatever was written,
    /// even if that is nothing.
    pub fn finalize(&mut self) -> Result<&Message, InvalidTransition> {
        match std::mem::take(&mut self.state) {
            ChatState::Streaming { placeholder, .. } => Ok(&self.conversation[placeholder]),
            other => {
                self.state = other;
                Err(self.invalid("finalize"))
            }
        }
    }

    /// Ends a failed turn by removing the placeholder. The user message
    /// stays so the conversation can be retried.
    pub fn rollback(&mut self, err: &ChatError) -> Result<Notice, InvalidTransition> {
        match std::mem::take(&mut self.state) {
            ChatState::Sending { placeholder } | ChatState::Streaming { placeholder, .. } => {
                self.conversation.truncate(placeholder);
                tracing::debug!(error = %err, "rolled back assistant placeholder");
                Ok(Notice::from(err))
            }
            ChatState::Idle => Err(self.invalid("roll back")),
        }
    }

    /// Runs one full turn against the relay. `on_update` sees the
    /// placeholder after every applied delta.
    pub async fn send<F>(
        &mut self,
        client: &CoachClient,
        text: &str,
        mut on_update: F,
    ) -> Result<TurnOutcome, SubmitRejected>
    where
        F: FnMut(&Message),
    {
        let payload = self.submit(text)?;

        let result = async {
            let response = client.open(&payload).await?;
            log_out_of_sync(self.begin_streaming());
            let end = read_deltas(response.bytes_stream(), |delta| {
                if let Err(err) = self.apply_delta(delta) {
                    tracing::warn!(%err, "dropping delta");
                } else if let Some(reply) = self.pending_reply() {
                    on_update(reply);
                }
            })
            .await?;
            Ok::<_, ChatError>(end)
        }
        .await;

        let outcome = match result {
            Ok(end) => {
                log_out_of_sync(self.finalize().map(|_| ()));
                TurnOutcome::Completed(end)
            }
            Err(err) => {
                tracing::warn!(error = %err, "chat turn failed");
                match self.rollback(&err) {
                    Ok(notice) => TurnOutcome::Failed(notice),
                    Err(transition) => {
                        tracing::error!(%transition, "rollback from unexpected state");
                        TurnOutcome::Failed(Notice::Failed)
                    }
                }
            }
        };
        Ok(outcome)
    }

    fn invalid(&self, action: &'static str) -> InvalidTransition {
        InvalidTransition {
            action,
            state: self.state.name(),
        }
    }
}

fn log_out_of_sync(result: Result<(), InvalidTransition>) {
    if let Err(err) = result {
        tracing::error!(%err, "chat state out of sync");
    }
}
