//! OpenAI-compatible [`LlmClient`] over Chat Completions and Embeddings.
//!
//! Streaming follows the [OpenAI streaming] contract: content arrives in
//! `choices[0].delta.content`, tool calls as partial deltas keyed by `index`
//! whose `id` is taken when present and whose name/argument fragments are
//! concatenated; the accumulated calls are complete when the upstream
//! signals `finish_reason = tool_calls` (or the stream ends).
//!
//! [OpenAI streaming]: https://platform.openai.com/docs/api-reference/chat-streaming

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::debug;

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionMessageToolCall, ChatCompletionMessageToolCalls,
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessage, ChatCompletionRequestToolMessageArgs,
        ChatCompletionRequestUserMessage, ChatCompletionTool, ChatCompletionTools,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, FunctionCall,
        FunctionObject,
    },
    types::embeddings::{CreateEmbeddingRequest, EmbeddingInput},
    Client,
};

use super::{
    estimate_chat_tokens, ChatMessage, ChatOutcome, LlmClient, LlmError, ToolCallRequest,
    ToolSpec,
};

/// Client for one OpenAI-compatible endpoint (key + base URL from settings;
/// per-turn model and temperature come from the agent config).
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
}

impl OpenAiClient {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);
        Self {
            client: Client::with_config(config),
        }
    }

    fn request_messages(messages: &[ChatMessage]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| match m {
                ChatMessage::System(s) => Ok(ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessage::from(s.as_str()),
                )),
                ChatMessage::User(s) => Ok(ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessage::from(s.as_str()),
                )),
                ChatMessage::Assistant {
                    content,
                    tool_calls,
                } => {
                    let mut args = ChatCompletionRequestAssistantMessageArgs::default();
                    if let Some(content) = content {
                        args.content(content.as_str());
                    }
                    if !tool_calls.is_empty() {
                        let calls: Vec<ChatCompletionMessageToolCalls> = tool_calls
                            .iter()
                            .map(|tc| {
                                ChatCompletionMessageToolCalls::Function(
                                    ChatCompletionMessageToolCall {
                                        id: tc.id.clone(),
                                        function: FunctionCall {
                                            name: tc.name.clone(),
                                            arguments: tc.arguments.clone(),
                                        },
                                    },
                                )
                            })
                            .collect();
                        args.tool_calls(calls);
                    }
                    args.build()
                        .map(ChatCompletionRequestMessage::Assistant)
                        .map_err(|e| LlmError::Request(e.to_string()))
                }
                ChatMessage::Tool {
                    tool_call_id,
                    content,
                } => ChatCompletionRequestToolMessageArgs::default()
                    .content(content.as_str())
                    .tool_call_id(tool_call_id.as_str())
                    .build()
                    .map(ChatCompletionRequestMessage::Tool)
                    .map_err(|e| LlmError::Request(e.to_string())),
            })
            .collect()
    }

    fn build_request(
        messages: &[ChatMessage],
        model: &str,
        temperature: f32,
        tools: Option<&[ToolSpec]>,
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(model);
        args.messages(Self::request_messages(messages)?);
        args.temperature(temperature);
        if stream {
            args.stream(true);
        }

        if let Some(tools) = tools {
            if !tools.is_empty() {
                let chat_tools: Vec<ChatCompletionTools> = tools
                    .iter()
                    .map(|t| {
                        ChatCompletionTools::Function(ChatCompletionTool {
                            function: FunctionObject {
                                name: t.name.clone(),
                                description: t.description.clone(),
                                parameters: Some(t.parameters.clone()),
                                ..Default::default()
                            },
                        })
                    })
                    .collect();
                args.tools(chat_tools);
            }
        }

        args.build().map_err(|e| LlmError::Request(e.to_string()))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, LlmError> {
        let request = CreateEmbeddingRequest {
            input: EmbeddingInput::String(text.to_string()),
            model: model.to_string(),
            ..Default::default()
        };
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| LlmError::Upstream(e.to_string()))?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(LlmError::Empty)
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f32,
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatOutcome, LlmError> {
        let request = Self::build_request(messages, model, temperature, tools, false)?;
        debug!(model, message_count = messages.len(), "chat completion");

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::Upstream(e.to_string()))?;

        let usage = response.usage.as_ref().map(|u| u.total_tokens);
        let choice = response.choices.into_iter().next().ok_or(LlmError::Empty)?;
        let content = choice.message.content.unwrap_or_default();
        let tool_calls: Vec<ToolCallRequest> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tc| match tc {
                ChatCompletionMessageToolCalls::Function(f) => Some(ToolCallRequest {
                    id: f.id,
                    name: f.function.name,
                    arguments: f.function.arguments,
                }),
                _ => None,
            })
            .collect();

        let tokens_used = match usage {
            Some(total) if total > 0 => Some(total),
            _ => Some(estimate_chat_tokens(messages, &content)),
        };

        Ok(ChatOutcome {
            content,
            tool_calls,
            tokens_used,
        })
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f32,
        tools: Option<&[ToolSpec]>,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome, LlmError> {
        let request = Self::build_request(messages, model, temperature, tools, true)?;
        debug!(model, message_count = messages.len(), "chat completion stream");

        let mut stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| LlmError::Upstream(e.to_string()))?;

        let mut content = String::new();
        // index → (id, name, argument fragments concatenated in arrival order)
        let mut pending: std::collections::BTreeMap<u32, (String, String, String)> =
            std::collections::BTreeMap::new();
        let mut tokens_used: Option<u32> = None;
        let mut receiver_gone = false;

        while let Some(result) = stream.next().await {
            let response = result.map_err(|e| LlmError::Upstream(e.to_string()))?;

            if let Some(ref usage) = response.usage {
                tokens_used = Some(usage.total_tokens);
            }

            for choice in response.choices {
                if let Some(ref delta) = choice.delta.content {
                    if !delta.is_empty() {
                        content.push_str(delta);
                        if !receiver_gone && chunk_tx.send(delta.clone()).await.is_err() {
                            // Consumer closed; stop forwarding, drain upstream
                            // via early return so tokens stop being consumed.
                            receiver_gone = true;
                        }
                    }
                }

                if let Some(ref tool_calls) = choice.delta.tool_calls {
                    for tc in tool_calls {
                        let entry = pending.entry(tc.index).or_default();
                        if let Some(ref id) = tc.id {
                            if !id.is_empty() {
                                entry.0 = id.clone();
                            }
                        }
                        if let Some(ref function) = tc.function {
                            if let Some(ref name) = function.name {
                                entry.1.push_str(name);
                            }
                            if let Some(ref arguments) = function.arguments {
                                entry.2.push_str(arguments);
                            }
                        }
                    }
                }
            }

            if receiver_gone {
                break;
            }
        }

        let tool_calls: Vec<ToolCallRequest> = pending
            .into_values()
            .map(|(id, name, arguments)| ToolCallRequest {
                id,
                name,
                arguments,
            })
            .collect();

        if tokens_used.is_none() {
            tokens_used = Some(estimate_chat_tokens(messages, &content));
        }

        Ok(ChatOutcome {
            content,
            tool_calls,
            tokens_used,
        })
    }
}
