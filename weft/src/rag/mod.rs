//! Retrieval-augmented generation: embed the query, fetch top-k contexts
//! from the agent's bound backend, and assemble the user prompt.
//!
//! Retrieval failures never fail the turn: they surface as an empty context
//! list, and the prompt then tells the model explicitly that nothing was
//! retrieved.

pub mod documents;
pub mod ingest;

pub use documents::RagDocumentService;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentConfig, RagBackendKind};
use crate::llm::LlmClient;
use crate::vector::VectorStore;

/// Default embedding model for the OpenAI-compatible endpoint.
pub const DEFAULT_EMBEDDING_MODEL: &str = "BAAI/bge-m3";

/// One retrieved context chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagContext {
    pub content: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

pub struct RagService {
    llm: Arc<dyn LlmClient>,
    qdrant: Option<Arc<dyn VectorStore>>,
    cache: Arc<dyn VectorStore>,
    embedding_model: String,
}

impl RagService {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        qdrant: Option<Arc<dyn VectorStore>>,
        cache: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            llm,
            qdrant,
            cache,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    /// The backend an agent binding dispatches to. `None` when the binding
    /// asks for Qdrant but no Qdrant client is configured.
    pub fn backend_for(&self, kind: RagBackendKind) -> Option<Arc<dyn VectorStore>> {
        match kind {
            RagBackendKind::Qdrant => self.qdrant.clone(),
            RagBackendKind::Cache => Some(self.cache.clone()),
        }
    }

    /// Retrieves top-k contexts for `query`. Agents without a RAG binding get
    /// an empty list; so does `top_k == 0` and every backend failure.
    pub async fn retrieve(
        &self,
        query: &str,
        agent: &AgentConfig,
        top_k_override: Option<u32>,
    ) -> Vec<RagContext> {
        let Some(ref binding) = agent.rag else {
            return Vec::new();
        };
        let top_k = top_k_override.unwrap_or(binding.top_k) as usize;
        if top_k == 0 {
            return Vec::new();
        }
        let Some(backend) = self.backend_for(binding.backend) else {
            tracing::warn!(agent_id = %agent.id, "RAG backend not configured, skipping retrieval");
            return Vec::new();
        };

        let embedding = match self.llm.embed(query, &self.embedding_model).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(agent_id = %agent.id, error = %e, "query embedding failed");
                return Vec::new();
            }
        };

        match backend.search(&binding.index_name, embedding, top_k).await {
            Ok(hits) => {
                tracing::info!(agent_id = %agent.id, count = hits.len(), "retrieved contexts");
                hits.into_iter()
                    .map(|hit| RagContext {
                        content: hit
                            .payload
                            .get("content")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        score: hit.score,
                        metadata: hit.payload.get("metadata").cloned().filter(|m| !m.is_null()),
                    })
                    .collect()
            }
            Err(e) => {
                tracing::error!(agent_id = %agent.id, error = %e, "context retrieval failed");
                Vec::new()
            }
        }
    }
}

fn format_context_metadata(metadata: Option<&serde_json::Value>) -> String {
    let Some(md) = metadata else {
        return String::new();
    };
    let mut parts = Vec::new();
    let source = md
        .get("source_file")
        .or_else(|| md.get("source"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if !source.is_empty() {
        parts.push(format!("Fonte: {source}"));
    }
    if let (Some(chunk), Some(total)) = (
        md.get("chunk_index").and_then(|v| v.as_i64()),
        md.get("total_chunks").and_then(|v| v.as_i64()),
    ) {
        parts.push(format!("Chunk: {}/{}", chunk + 1, total));
    }
    if let Some(file_type) = md.get("file_type").and_then(|v| v.as_str()) {
        if !file_type.is_empty() {
            parts.push(format!("Tipo: {file_type}"));
        }
    }
    parts.join(" | ")
}

/// Wraps the user's question with the retrieved contexts, or with the
/// explicit no-context preamble when retrieval came back empty.
pub fn build_user_content(text: &str, contexts: &[RagContext]) -> String {
    if contexts.is_empty() {
        return format!(
            "Nenhum contexto foi recuperado da base de conhecimento (RAG) deste agente.\n\n\
             Pergunta: {text}\n\n\
             Instrução: se a resposta depender de documentos internos, informe que não há \
             trechos recuperados e oriente como melhorar a consulta ou acionar a carga de documentos."
        );
    }

    let blocks: Vec<String> = contexts
        .iter()
        .enumerate()
        .map(|(i, ctx)| {
            let header = format!("[Contexto {}] (score={:.3})", i + 1, ctx.score);
            let meta = format_context_metadata(ctx.metadata.as_ref());
            [header, meta, ctx.content.clone()]
                .into_iter()
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect();

    format!(
        "Contextos relevantes:\n{}\n\nCom base nos contextos acima, responda à seguinte pergunta:\n\nPergunta: {text}",
        blocks.join("\n\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::RagBinding;
    use crate::llm::ScriptedLlm;
    use crate::vector::{VectorHit, VectorStoreError};
    use async_trait::async_trait;

    struct FixedHits(Vec<VectorHit>);

    #[async_trait]
    impl VectorStore for FixedHits {
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
            Ok(self.0.len() as u64)
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
            top_k: usize,
        ) -> Result<Vec<VectorHit>, VectorStoreError> {
            Ok(self.0.iter().take(top_k).cloned().collect())
        }
        async fn exists(&self, _n: &str, _i: &str) -> Result<bool, VectorStoreError> {
            Ok(false)
        }
        async fn list_collections(&self) -> Result<Vec<String>, VectorStoreError> {
            Ok(Vec::new())
        }
    }

    fn agent_with_rag(top_k: u32) -> AgentConfig {
        AgentConfig {
            id: "geo".into(),
            name: None,
            group_id: None,
            model: "m".into(),
            api_key: None,
            webhook_name: None,
            system_prompt: "p".into(),
            input_schema: serde_json::json!({}),
            output_schema: serde_json::json!({}),
            rag: Some(RagBinding {
                backend: RagBackendKind::Cache,
                index_name: "docs".into(),
                top_k,
                chunk_size: 1500,
                overlap: 300,
            }),
            data_analysis: None,
            tools: Vec::new(),
            webhook_output_url: None,
        }
    }

    fn service_with_hits(hits: Vec<VectorHit>) -> RagService {
        RagService::new(
            Arc::new(ScriptedLlm::default()),
            None,
            Arc::new(FixedHits(hits)),
        )
    }

    fn paris_hit() -> VectorHit {
        VectorHit {
            id: "d1".into(),
            score: 0.93,
            payload: serde_json::json!({
                "content": "Paris is the capital of France.",
                "metadata": {"source_file": "geo.txt", "chunk_index": 0, "total_chunks": 2, "file_type": ".txt"},
            }),
        }
    }

    #[tokio::test]
    async fn agent_without_binding_retrieves_nothing() {
        let service = service_with_hits(vec![paris_hit()]);
        let mut agent = agent_with_rag(5);
        agent.rag = None;
        assert!(service.retrieve("q", &agent, None).await.is_empty());
    }

    #[tokio::test]
    async fn top_k_zero_returns_empty() {
        let service = service_with_hits(vec![paris_hit()]);
        let agent = agent_with_rag(5);
        assert!(service.retrieve("q", &agent, Some(0)).await.is_empty());
    }

    #[tokio::test]
    async fn hits_become_contexts_with_metadata() {
        let service = service_with_hits(vec![paris_hit()]);
        let agent = agent_with_rag(2);
        let contexts = service.retrieve("capital of France?", &agent, None).await;
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].content, "Paris is the capital of France.");
        assert!(contexts[0].metadata.is_some());
    }

    #[tokio::test]
    async fn qdrant_binding_without_client_is_empty_not_fatal() {
        let service = service_with_hits(vec![paris_hit()]);
        let mut agent = agent_with_rag(2);
        agent.rag.as_mut().unwrap().backend = RagBackendKind::Qdrant;
        assert!(service.retrieve("q", &agent, None).await.is_empty());
    }

    #[test]
    fn user_content_numbers_contexts_and_carries_metadata() {
        let contexts = vec![
            RagContext {
                content: "Paris is the capital of France.".into(),
                score: 0.93,
                metadata: Some(serde_json::json!({
                    "source_file": "geo.txt", "chunk_index": 0, "total_chunks": 2, "file_type": ".txt",
                })),
            },
            RagContext {
                content: "France is in Europe.".into(),
                score: 0.80,
                metadata: None,
            },
        ];
        let content = build_user_content("capital of France?", &contexts);
        assert!(content.starts_with("Contextos relevantes:\n[Contexto 1] (score=0.930)"));
        assert!(content.contains("Fonte: geo.txt | Chunk: 1/2 | Tipo: .txt"));
        assert!(content.contains("[Contexto 2] (score=0.800)"));
        assert!(content.ends_with("Pergunta: capital of France?"));
    }

    #[test]
    fn user_content_without_contexts_uses_the_no_context_preamble() {
        let content = build_user_content("anything?", &[]);
        assert!(content.starts_with("Nenhum contexto foi recuperado"));
        assert!(content.contains("Pergunta: anything?"));
    }
}
