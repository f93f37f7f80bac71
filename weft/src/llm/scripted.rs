//! Scripted LLM double for tests: pops pre-canned outcomes in order and
//! records every message list it was invoked with.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{estimate_chat_tokens, ChatMessage, ChatOutcome, LlmClient, LlmError, ToolSpec};

/// Test double implementing [`LlmClient`].
///
/// Each `chat` / `chat_stream` call pops the next scripted outcome; when the
/// script runs dry, calls fail with [`LlmError::Empty`]. `chat_stream` sends
/// the content character by character so SSE paths see many chunks.
/// `embed` returns a deterministic 8-dim vector derived from the text bytes.
#[derive(Default)]
pub struct ScriptedLlm {
    script: Mutex<std::collections::VecDeque<ChatOutcome>>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn new(outcomes: impl IntoIterator<Item = ChatOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a script of plain-text replies.
    pub fn replies(texts: impl IntoIterator<Item = &'static str>) -> Self {
        Self::new(texts.into_iter().map(|t| ChatOutcome {
            content: t.to_string(),
            ..Default::default()
        }))
    }

    /// Message lists from every call, in order.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }

    fn next(&self, messages: &[ChatMessage]) -> Result<ChatOutcome, LlmError> {
        self.seen.lock().unwrap().push(messages.to_vec());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(LlmError::Empty)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn embed(&self, text: &str, _model: &str) -> Result<Vec<f32>, LlmError> {
        let mut v = [0f32; 8];
        for (i, b) in text.bytes().enumerate() {
            v[i % 8] += f32::from(b) / 255.0;
        }
        Ok(v.to_vec())
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _model: &str,
        _temperature: f32,
        _tools: Option<&[ToolSpec]>,
    ) -> Result<ChatOutcome, LlmError> {
        let mut outcome = self.next(messages)?;
        if outcome.tokens_used.is_none() {
            outcome.tokens_used = Some(estimate_chat_tokens(messages, &outcome.content));
        }
        Ok(outcome)
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f32,
        tools: Option<&[ToolSpec]>,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome, LlmError> {
        let outcome = self.chat(messages, model, temperature, tools).await?;
        for ch in outcome.content.chars() {
            let _ = chunk_tx.send(ch.to_string()).await;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_outcomes_pop_in_order_then_run_dry() {
        let llm = ScriptedLlm::replies(["one", "two"]);
        let first = llm.chat(&[], "m", 0.7, None).await.unwrap();
        assert_eq!(first.content, "one");
        assert!(first.tokens_used.unwrap() >= 1);
        assert_eq!(llm.chat(&[], "m", 0.7, None).await.unwrap().content, "two");
        assert!(llm.chat(&[], "m", 0.7, None).await.is_err());
    }

    #[tokio::test]
    async fn chat_stream_emits_per_character_chunks() {
        let llm = ScriptedLlm::replies(["Hi"]);
        let (tx, mut rx) = mpsc::channel(8);
        let outcome = llm.chat_stream(&[], "m", 0.7, None, tx).await.unwrap();
        assert_eq!(outcome.content, "Hi");
        assert_eq!(rx.recv().await.unwrap(), "H");
        assert_eq!(rx.recv().await.unwrap(), "i");
    }

    #[tokio::test]
    async fn embed_is_deterministic() {
        let llm = ScriptedLlm::default();
        let a = llm.embed("hello", "m").await.unwrap();
        let b = llm.embed("hello", "m").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[tokio::test]
    async fn calls_record_the_message_lists() {
        let llm = ScriptedLlm::replies(["ok"]);
        let messages = vec![ChatMessage::User("q".into())];
        llm.chat(&messages, "m", 0.7, None).await.unwrap();
        assert_eq!(llm.calls(), vec![messages]);
    }
}
