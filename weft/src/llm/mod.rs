//! LLM client abstraction: embeddings plus buffered and streaming chat
//! completions with tool-call support.
//!
//! [`LlmClient`] is the seam the agent service programs against.
//! Implementations: [`OpenAiClient`] (OpenAI-compatible HTTP endpoint) and
//! [`ScriptedLlm`] (fixed responses for tests).
//!
//! # Streaming
//!
//! `chat_stream` accepts an `mpsc::Sender<String>` and sends content deltas
//! through it as they arrive; the complete [`ChatOutcome`] (including any
//! accumulated tool calls) is returned when the upstream stream ends.
//! Dropping the receiver makes sends fail silently and the upstream poll
//! stops with the turn.

mod openai;
mod scripted;

pub use openai::OpenAiClient;
pub use scripted::ScriptedLlm;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("request build failed: {0}")]
    Request(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("upstream returned no choices")]
    Empty,
}

/// One chat message in the conversation sent upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn assistant_text(content: impl Into<String>) -> Self {
        ChatMessage::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Text content used for token estimation.
    fn content_text(&self) -> &str {
        match self {
            ChatMessage::System(s) | ChatMessage::User(s) => s,
            ChatMessage::Assistant { content, .. } => content.as_deref().unwrap_or(""),
            ChatMessage::Tool { content, .. } => content,
        }
    }
}

/// A complete tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as produced by the model.
    pub arguments: String,
}

/// Function descriptor advertised to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

/// Result of one chat completion call.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tokens_used: Option<u32>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Embeds one text into a dense vector.
    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, LlmError>;

    /// Buffered chat completion.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f32,
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatOutcome, LlmError>;

    /// Streaming chat completion: content deltas go through `chunk_tx` as
    /// they arrive, the full outcome is returned at the end.
    ///
    /// Default implementation delegates to [`chat`](LlmClient::chat) and
    /// sends the whole content as one chunk.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f32,
        tools: Option<&[ToolSpec]>,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome, LlmError> {
        let outcome = self.chat(messages, model, temperature, tools).await?;
        if !outcome.content.is_empty() {
            let _ = chunk_tx.send(outcome.content.clone()).await;
        }
        Ok(outcome)
    }
}

/// Estimated token count for a text: `⌈len/4⌉`, floor 1 for non-empty input.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    (text.len().div_ceil(4)).max(1) as u32
}

/// Fallback when the upstream omits usage: prompt contents plus completion.
pub fn estimate_chat_tokens(messages: &[ChatMessage], completion: &str) -> u32 {
    let prompt: String = messages
        .iter()
        .map(ChatMessage::content_text)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    estimate_tokens(&prompt) + estimate_tokens(completion)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_is_at_least_one_for_non_empty_text() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn chat_estimate_sums_prompt_and_completion() {
        let messages = vec![
            ChatMessage::System("abcd".into()),
            ChatMessage::User("efgh".into()),
        ];
        // prompt joins to "abcd\nefgh" (9 chars → 3 tokens), completion 4 chars → 1.
        assert_eq!(estimate_chat_tokens(&messages, "wxyz"), 4);
    }

    #[tokio::test]
    async fn default_chat_stream_sends_full_content_as_one_chunk() {
        struct Fixed;
        #[async_trait]
        impl LlmClient for Fixed {
            async fn embed(&self, _t: &str, _m: &str) -> Result<Vec<f32>, LlmError> {
                Ok(vec![0.0])
            }
            async fn chat(
                &self,
                _messages: &[ChatMessage],
                _model: &str,
                _temperature: f32,
                _tools: Option<&[ToolSpec]>,
            ) -> Result<ChatOutcome, LlmError> {
                Ok(ChatOutcome {
                    content: "hello".into(),
                    ..Default::default()
                })
            }
        }

        let (tx, mut rx) = mpsc::channel(2);
        let outcome = Fixed
            .chat_stream(&[], "m", 0.7, None, tx)
            .await
            .unwrap();
        assert_eq!(outcome.content, "hello");
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }
}
