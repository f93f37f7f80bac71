//! # Weft
//!
//! Multi-tenant AI-agent orchestration. External channels submit a user
//! message targeted at a named *agent*; the service enriches it with
//! retrieved context and tool results, drives a streaming LLM completion,
//! and delivers the answer synchronously (SSE) or through a durable
//! Redis-stream queue with an outbound webhook.
//!
//! ## Main modules
//!
//! - [`settings`]: typed runtime configuration from the environment.
//! - [`crypto`]: AEAD encryption of sensitive config fields (`enc:` prefix).
//! - [`auth`]: password hashing, signed revocable bearer tokens, the
//!   SQLite relational store, RBAC helpers.
//! - [`queue`]: Redis streams job queue (consumer groups, at-least-once),
//!   pub/sub, and the key-value/counter/list/set primitives.
//! - [`vector`]: [`vector::VectorStore`] over Qdrant and a cache-backed
//!   brute-force backend.
//! - [`llm`]: [`llm::LlmClient`] — embeddings plus buffered/streaming chat
//!   with tool-call accumulation; [`llm::OpenAiClient`], [`llm::ScriptedLlm`].
//! - [`agent`]: [`agent::AgentConfig`], the hot-reloadable
//!   [`agent::AgentRegistry`], and the turn-driving [`agent::AgentService`].
//! - [`rag`]: retrieval, prompt assembly, document lifecycle, chunking with
//!   deterministic ids.
//! - [`tabular`]: per-agent frames and the restricted query interpreter
//!   behind the `query_data` tool.
//! - [`worker`]: the consumer pool, outbound webhook delivery, opt-in retry
//!   schedule and DLQ.
//! - [`metrics`]: per-agent and global counters with rolling response-time
//!   windows.
//!
//! The HTTP surface (axum router, auth middleware, sanitizer, SSE) lives in
//! the sibling `serve` crate.

pub mod agent;
pub mod auth;
pub mod crypto;
pub mod llm;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod rag;
pub mod settings;
pub mod tabular;
pub mod vector;
pub mod worker;

pub use agent::{AgentConfig, AgentRegistry, AgentService};
pub use message::{AgentReply, Channel, HistoryEntry, InboundMessage, Job};
pub use metrics::MetricsService;
pub use queue::QueueClient;
pub use settings::Settings;
