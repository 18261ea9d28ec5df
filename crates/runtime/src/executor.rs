//! The turn-executor port — the runtime's only dependency on a language
//! model.
//!
//! Given a reduced context, an executor yields a finite stream of chunks
//! (text deltas, then the final assistant message) or fails.  Provider
//! wire formats live behind this trait and are not part of the runtime.

use std::pin::Pin;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ca_domain::event::LlmConfig;
use ca_domain::reducer::{ChatMessage, Role};
use ca_domain::Result;

/// A boxed async stream, used for turn output.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// The output stream of one turn.  Finite; ends after the assistant
/// message.
pub type TurnStream = BoxStream<'static, Result<TurnChunk>>;

/// One unit of turn output.
#[derive(Debug, Clone)]
pub enum TurnChunk {
    /// Incremental assistant text.
    TextDelta { delta: String },
    /// The final assistant message (full text).
    AssistantMessage { content: String },
}

/// Everything an executor sees of the agent: the projected conversation
/// and the provider addressing, snapshotted at turn start.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub agent_name: String,
    pub messages: Vec<ChatMessage>,
    pub llm_config: Option<LlmConfig>,
}

/// Drives one language-model request.
///
/// Executors must stop producing promptly when `cancel` fires; dropping
/// the returned stream is also cancellation.
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    async fn execute(&self, ctx: TurnContext, cancel: CancellationToken) -> Result<TurnStream>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EchoExecutor — development executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streams the latest user message back, word by word.  Lets the server
/// and CLI run end-to-end without a provider integration.
pub struct EchoExecutor;

#[async_trait]
impl TurnExecutor for EchoExecutor {
    async fn execute(&self, ctx: TurnContext, _cancel: CancellationToken) -> Result<TurnStream> {
        let reply = ctx
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let stream = async_stream::stream! {
            for word in reply.split_inclusive(' ') {
                yield Ok(TurnChunk::TextDelta {
                    delta: word.to_string(),
                });
            }
            yield Ok(TurnChunk::AssistantMessage { content: reply });
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn echo_streams_last_user_message() {
        let ctx = TurnContext {
            agent_name: "a".into(),
            messages: vec![
                ChatMessage::user("first"),
                ChatMessage::assistant("ignored"),
                ChatMessage::user("hello world"),
            ],
            llm_config: None,
        };

        let mut stream = EchoExecutor
            .execute(ctx, CancellationToken::new())
            .await
            .unwrap();

        let mut deltas = String::new();
        let mut final_content = None;
        while let Some(chunk) = stream.next().await {
            match chunk.unwrap() {
                TurnChunk::TextDelta { delta } => deltas.push_str(&delta),
                TurnChunk::AssistantMessage { content } => final_content = Some(content),
            }
        }

        assert_eq!(deltas, "hello world");
        assert_eq!(final_content.as_deref(), Some("hello world"));
    }
}
