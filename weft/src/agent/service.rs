//! The LLM-driving turn: RAG retrieval → prompt assembly → completion →
//! tool-call loop → final response.
//!
//! One turn makes at most two model calls: when the first returns tool
//! calls, each is executed (only `query_data` is implemented by the core;
//! any other name produces a not-implemented tool result), the results are
//! appended, and the model is called once more. There is no deeper
//! tool-chaining recursion.
//!
//! Failure semantics: any error inside the turn becomes the user-visible
//! reply `"Erro ao processar mensagem: <error>"`; the turn still completes
//! and the caller records it as `success = false`.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::AgentConfig;
use crate::llm::{ChatMessage, ChatOutcome, LlmClient, LlmError, ToolCallRequest, ToolSpec};
use crate::message::{AgentReply, HistoryEntry, InboundMessage};
use crate::rag::{build_user_content, RagContext, RagService};
use crate::tabular::DataService;

const TEMPERATURE: f32 = 0.7;

pub struct AgentService {
    llm: Arc<dyn LlmClient>,
    rag: Arc<RagService>,
    data: Option<Arc<DataService>>,
}

impl AgentService {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        rag: Arc<RagService>,
        data: Option<Arc<DataService>>,
    ) -> Self {
        Self { llm, rag, data }
    }

    /// Non-streaming turn (worker path).
    pub async fn run_turn(
        &self,
        agent: &AgentConfig,
        message: &InboundMessage,
        history: &[HistoryEntry],
    ) -> AgentReply {
        let conversation_id = message
            .conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match self.drive(agent, message, history, None).await {
            Ok((text, contexts, tokens_used)) => AgentReply {
                agent_id: agent.id.clone(),
                conversation_id,
                response: text,
                contexts,
                tokens_used,
                created_at: chrono::Utc::now(),
            },
            Err(e) => {
                tracing::error!(agent_id = %agent.id, error = %e, "turn failed");
                AgentReply {
                    agent_id: agent.id.clone(),
                    conversation_id,
                    response: format!("Erro ao processar mensagem: {e}"),
                    contexts: Vec::new(),
                    tokens_used: None,
                    created_at: chrono::Utc::now(),
                }
            }
        }
    }

    /// Streaming turn (SSE path): content chunks are sent through
    /// `chunk_tx` as they arrive; an error is delivered as one final chunk
    /// carrying the error reply.
    pub async fn run_turn_streaming(
        &self,
        agent: &AgentConfig,
        message: &InboundMessage,
        history: &[HistoryEntry],
        chunk_tx: mpsc::Sender<String>,
    ) -> AgentReply {
        let conversation_id = message
            .conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match self
            .drive(agent, message, history, Some(chunk_tx.clone()))
            .await
        {
            Ok((text, contexts, tokens_used)) => AgentReply {
                agent_id: agent.id.clone(),
                conversation_id,
                response: text,
                contexts,
                tokens_used,
                created_at: chrono::Utc::now(),
            },
            Err(e) => {
                tracing::error!(agent_id = %agent.id, error = %e, "streaming turn failed");
                let text = format!("Erro ao processar mensagem: {e}");
                let _ = chunk_tx.send(text.clone()).await;
                AgentReply {
                    agent_id: agent.id.clone(),
                    conversation_id,
                    response: text,
                    contexts: Vec::new(),
                    tokens_used: None,
                    created_at: chrono::Utc::now(),
                }
            }
        }
    }

    async fn drive(
        &self,
        agent: &AgentConfig,
        message: &InboundMessage,
        history: &[HistoryEntry],
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<(String, Vec<RagContext>, Option<u32>), LlmError> {
        // RETRIEVE
        let contexts = self.rag.retrieve(&message.text, agent, None).await;

        // ASSEMBLE
        let mut messages = assemble_messages(agent, &message.text, history, &contexts);
        let tools = self.tool_specs(agent);

        // CALL_MODEL
        let first = self
            .call_model(&messages, agent, tools.as_deref(), chunk_tx.clone())
            .await?;
        let mut tokens_used = first.tokens_used;

        if first.tool_calls.is_empty() {
            return Ok((first.content, contexts, tokens_used));
        }

        // RUN_TOOLS: assistant turn with the calls, then one tool turn each,
        // in the order the model returned them.
        messages.push(ChatMessage::Assistant {
            content: if first.content.is_empty() {
                None
            } else {
                Some(first.content.clone())
            },
            tool_calls: first.tool_calls.clone(),
        });
        for call in &first.tool_calls {
            let result = self.execute_tool_call(&agent.id, call).await;
            messages.push(ChatMessage::Tool {
                tool_call_id: call.id.clone(),
                content: serde_json::to_string(&result)
                    .unwrap_or_else(|_| "{\"success\":false}".to_string()),
            });
        }

        // Second (and last) model call with the tool results.
        let second = self
            .call_model(&messages, agent, tools.as_deref(), chunk_tx)
            .await?;
        tokens_used = match (tokens_used, second.tokens_used) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };

        Ok((second.content, contexts, tokens_used))
    }

    async fn call_model(
        &self,
        messages: &[ChatMessage],
        agent: &AgentConfig,
        tools: Option<&[ToolSpec]>,
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<ChatOutcome, LlmError> {
        match chunk_tx {
            Some(tx) => {
                self.llm
                    .chat_stream(messages, &agent.model, TEMPERATURE, tools, tx)
                    .await
            }
            None => {
                self.llm
                    .chat(messages, &agent.model, TEMPERATURE, tools)
                    .await
            }
        }
    }

    /// Tool descriptors for this agent: declared tools plus the `query_data`
    /// function when the tabular tool is enabled.
    fn tool_specs(&self, agent: &AgentConfig) -> Option<Vec<ToolSpec>> {
        let mut specs: Vec<ToolSpec> = agent
            .tools
            .iter()
            .map(|tool| ToolSpec {
                name: tool.name.clone(),
                description: Some(
                    tool.description
                        .clone()
                        .unwrap_or_else(|| format!("Tool: {}", tool.name)),
                ),
                parameters: tool.parameters.clone().unwrap_or(serde_json::json!({})),
            })
            .collect();

        if agent.data_analysis_enabled() {
            if let Some(ref data) = self.data {
                if let Some(ref binding) = agent.data_analysis {
                    if !binding.files.is_empty() && !data.has_frames(&agent.id) {
                        data.load_agent_files(&agent.id, &binding.files);
                    }
                }
                let layout = data.frame_summaries(&agent.id);
                let layout_text = if layout["files"]
                    .as_array()
                    .is_some_and(|files| !files.is_empty())
                {
                    serde_json::to_string_pretty(&layout).unwrap_or_default()
                } else {
                    "Nenhum arquivo carregado".to_string()
                };
                specs.push(ToolSpec {
                    name: "query_data".into(),
                    description: Some(
                        "Executa queries em dados carregados (CSV, JSON, XLSX). Use esta \
                         ferramenta para analisar dados, filtrar, agregar, calcular \
                         estatísticas, etc."
                            .into(),
                    ),
                    parameters: serde_json::json!({
                        "type": "object",
                        "properties": {
                            "query": {
                                "type": "string",
                                "description": format!(
                                    "Query a ser executada. Dados disponíveis: {layout_text}. \
                                     Exemplos: 'df.head()', 'df.describe()', \
                                     'df[df[\"coluna\"] > 10]', 'df.groupby(\"coluna\").sum()'"
                                ),
                            }
                        },
                        "required": ["query"],
                    }),
                });
            }
        }

        if specs.is_empty() {
            None
        } else {
            Some(specs)
        }
    }

    /// Executes one tool call. The tabular engine is blocking, so it runs on
    /// the blocking pool; unknown tool names produce a not-implemented
    /// result rather than an error.
    async fn execute_tool_call(
        &self,
        agent_id: &str,
        call: &ToolCallRequest,
    ) -> serde_json::Value {
        if call.name == "query_data" {
            let Some(data) = self.data.clone() else {
                return serde_json::json!({
                    "success": false,
                    "error": "Data analysis service not available",
                });
            };
            let query = serde_json::from_str::<serde_json::Value>(&call.arguments)
                .ok()
                .and_then(|args| args.get("query").and_then(|q| q.as_str()).map(String::from))
                .unwrap_or_default();
            let agent_id = agent_id.to_string();
            let outcome = tokio::task::spawn_blocking(move || {
                data.execute_query(&agent_id, &query)
            })
            .await;
            match outcome {
                Ok(outcome) => serde_json::to_value(outcome)
                    .unwrap_or_else(|_| serde_json::json!({"success": false})),
                Err(e) => serde_json::json!({
                    "success": false,
                    "error": format!("Query execution error: {e}"),
                }),
            }
        } else {
            serde_json::json!({
                "success": false,
                "error": format!("Tool {} not implemented", call.name),
            })
        }
    }
}

/// System prompt, then sanitized history (user/assistant roles only), then
/// the user message wrapped with contexts or the no-context preamble.
fn assemble_messages(
    agent: &AgentConfig,
    text: &str,
    history: &[HistoryEntry],
    contexts: &[RagContext],
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::System(agent.system_prompt.clone())];
    for entry in history {
        match entry.role.as_str() {
            "user" => messages.push(ChatMessage::User(entry.content.clone())),
            "assistant" => messages.push(ChatMessage::assistant_text(entry.content.clone())),
            _ => {}
        }
    }
    messages.push(ChatMessage::User(build_user_content(text, contexts)));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::message::Channel;
    use crate::vector::{VectorStore, VectorStoreError};
    use async_trait::async_trait;

    struct EmptyStore;

    #[async_trait]
    impl VectorStore for EmptyStore {
        async fn ensure_collection(&self, _n: &str, _d: usize) -> Result<(), VectorStoreError> {
            Ok(())
        }
        async fn upsert(
            &self,
            _n: &str,
            _i: &str,
            _v: Vec<f32>,
            _p: serde_json::Value,
        ) -> Result<(), VectorStoreError> {
            Ok(())
        }
        async fn delete(&self, _n: &str, _i: &str) -> Result<bool, VectorStoreError> {
            Ok(false)
        }
        async fn count(&self, _n: &str) -> Result<u64, VectorStoreError> {
            Ok(0)
        }
        async fn scroll(
            &self,
            _n: &str,
            _l: usize,
        ) -> Result<(Vec<crate::vector::VectorRecord>, Option<String>), VectorStoreError> {
            Ok((Vec::new(), None))
        }
        async fn search(
            &self,
            _n: &str,
            _v: Vec<f32>,
            _k: usize,
        ) -> Result<Vec<crate::vector::VectorHit>, VectorStoreError> {
            Ok(Vec::new())
        }
        async fn exists(&self, _n: &str, _i: &str) -> Result<bool, VectorStoreError> {
            Ok(false)
        }
        async fn list_collections(&self) -> Result<Vec<String>, VectorStoreError> {
            Ok(Vec::new())
        }
    }

    fn echo_agent() -> AgentConfig {
        AgentConfig {
            id: "echo".into(),
            name: None,
            group_id: None,
            model: "gpt-4o-mini".into(),
            api_key: None,
            webhook_name: None,
            system_prompt: "Repeat the user.".into(),
            input_schema: serde_json::json!({}),
            output_schema: serde_json::json!({}),
            rag: None,
            data_analysis: None,
            tools: Vec::new(),
            webhook_output_url: None,
        }
    }

    fn inbound(text: &str) -> InboundMessage {
        InboundMessage {
            user_id: "u".into(),
            channel: Channel::Web,
            text: text.into(),
            metadata: Default::default(),
            conversation_id: None,
        }
    }

    fn service(llm: Arc<ScriptedLlm>, data: Option<Arc<DataService>>) -> AgentService {
        let rag = Arc::new(RagService::new(llm.clone(), None, Arc::new(EmptyStore)));
        AgentService::new(llm, rag, data)
    }

    #[tokio::test]
    async fn plain_turn_returns_the_model_reply() {
        let llm = Arc::new(ScriptedLlm::replies(["Hello"]));
        let svc = service(llm.clone(), None);
        let reply = svc.run_turn(&echo_agent(), &inbound("Hello"), &[]).await;
        assert_eq!(reply.response, "Hello");
        assert_eq!(reply.agent_id, "echo");
        assert!(reply.tokens_used.unwrap() >= 1);
        assert!(!reply.conversation_id.is_empty());

        let calls = llm.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], ChatMessage::System("Repeat the user.".into()));
        // No RAG binding → the no-context preamble wraps the question.
        match &calls[0][1] {
            ChatMessage::User(content) => {
                assert!(content.contains("Nenhum contexto foi recuperado"));
                assert!(content.contains("Pergunta: Hello"));
            }
            other => panic!("expected user message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn history_is_filtered_to_user_and_assistant_roles() {
        let llm = Arc::new(ScriptedLlm::replies(["ok"]));
        let svc = service(llm.clone(), None);
        let history = vec![
            HistoryEntry {
                role: "user".into(),
                content: "earlier question".into(),
            },
            HistoryEntry {
                role: "assistant".into(),
                content: "earlier answer".into(),
            },
            HistoryEntry {
                role: "system".into(),
                content: "dropped".into(),
            },
            HistoryEntry {
                role: "tool".into(),
                content: "dropped too".into(),
            },
        ];
        svc.run_turn(&echo_agent(), &inbound("next"), &history).await;

        let messages = &llm.calls()[0];
        assert_eq!(messages.len(), 4); // system + 2 history + user
        assert_eq!(messages[1], ChatMessage::User("earlier question".into()));
        assert_eq!(messages[2], ChatMessage::assistant_text("earlier answer"));
    }

    #[tokio::test]
    async fn failed_turn_reports_the_error_reply() {
        // Empty script → first call errors.
        let llm = Arc::new(ScriptedLlm::default());
        let svc = service(llm, None);
        let reply = svc.run_turn(&echo_agent(), &inbound("hi"), &[]).await;
        assert!(reply.response.starts_with("Erro ao processar mensagem:"));
        assert!(reply.tokens_used.is_none());
    }

    #[tokio::test]
    async fn streaming_turn_forwards_chunks() {
        let llm = Arc::new(ScriptedLlm::replies(["Hello"]));
        let svc = service(llm, None);
        let (tx, mut rx) = mpsc::channel(16);
        let reply = svc
            .run_turn_streaming(&echo_agent(), &inbound("Hello"), &[], tx)
            .await;
        assert_eq!(reply.response, "Hello");

        let mut streamed = String::new();
        while let Ok(chunk) = rx.try_recv() {
            streamed.push_str(&chunk);
        }
        assert_eq!(streamed, "Hello");
    }

    #[tokio::test]
    async fn streaming_error_arrives_as_one_final_chunk() {
        let llm = Arc::new(ScriptedLlm::default());
        let svc = service(llm, None);
        let (tx, mut rx) = mpsc::channel(16);
        let reply = svc
            .run_turn_streaming(&echo_agent(), &inbound("hi"), &[], tx)
            .await;
        assert!(reply.response.starts_with("Erro ao processar mensagem:"));
        assert_eq!(rx.recv().await.unwrap(), reply.response);
    }

    /// **Scenario**: data-analysis agent with a preloaded CSV. First model
    /// call requests `query_data(describe())`, the second produces the final
    /// text. Message sequence must be: system, user,
    /// assistant-with-tool_calls, tool-result, and tokens sum across calls.
    #[tokio::test]
    async fn tool_call_loop_runs_query_data_and_recalls_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let data = Arc::new(DataService::new(dir.path()));
        data.save_file(
            "analyst",
            "scores.csv",
            b"name,score\nana,42\nbob,42\n",
        )
        .unwrap();

        let llm = Arc::new(ScriptedLlm::new([
            ChatOutcome {
                content: String::new(),
                tool_calls: vec![ToolCallRequest {
                    id: "call_1".into(),
                    name: "query_data".into(),
                    arguments: r#"{"query": "describe()"}"#.into(),
                }],
                tokens_used: Some(10),
            },
            ChatOutcome {
                content: "mean score is 42".into(),
                tool_calls: Vec::new(),
                tokens_used: Some(7),
            },
        ]));
        let svc = service(llm.clone(), Some(data));

        let mut agent = echo_agent();
        agent.id = "analyst".into();
        agent.data_analysis = Some(crate::agent::DataAnalysisConfig {
            enabled: true,
            files: vec!["scores.csv".into()],
            engine: "frame".into(),
        });

        let reply = svc.run_turn(&agent, &inbound("average score?"), &[]).await;
        assert_eq!(reply.response, "mean score is 42");
        assert_eq!(reply.tokens_used, Some(17));

        let calls = llm.calls();
        assert_eq!(calls.len(), 2);
        let second = &calls[1];
        assert!(matches!(second[0], ChatMessage::System(_)));
        assert!(matches!(second[1], ChatMessage::User(_)));
        match &second[2] {
            ChatMessage::Assistant { tool_calls, .. } => {
                assert_eq!(tool_calls[0].name, "query_data");
            }
            other => panic!("expected assistant tool-call turn, got {other:?}"),
        }
        match &second[3] {
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => {
                assert_eq!(tool_call_id, "call_1");
                let result: serde_json::Value = serde_json::from_str(content).unwrap();
                assert_eq!(result["success"], true);
            }
            other => panic!("expected tool-result turn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tools_come_back_not_implemented() {
        let llm = Arc::new(ScriptedLlm::new([
            ChatOutcome {
                content: String::new(),
                tool_calls: vec![ToolCallRequest {
                    id: "call_9".into(),
                    name: "send_email".into(),
                    arguments: "{}".into(),
                }],
                tokens_used: Some(1),
            },
            ChatOutcome {
                content: "done".into(),
                tool_calls: Vec::new(),
                tokens_used: Some(1),
            },
        ]));
        let svc = service(llm.clone(), None);
        let mut agent = echo_agent();
        agent.tools = vec![crate::agent::ToolConfig {
            name: "send_email".into(),
            kind: "http".into(),
            url: None,
            description: None,
            parameters: None,
        }];

        let reply = svc.run_turn(&agent, &inbound("mail it"), &[]).await;
        assert_eq!(reply.response, "done");

        let second = &llm.calls()[1];
        match &second[3] {
            ChatMessage::Tool { content, .. } => {
                let result: serde_json::Value = serde_json::from_str(content).unwrap();
                assert_eq!(result["success"], false);
                assert_eq!(result["error"], "Tool send_email not implemented");
            }
            other => panic!("expected tool-result turn, got {other:?}"),
        }
    }
}
