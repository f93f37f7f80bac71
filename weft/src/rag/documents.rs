//! Document lifecycle on top of the vector backends: add, delete, list,
//! stats, and similarity search for the `/rag` API surface.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::agent::RagBackendKind;
use crate::llm::LlmClient;
use crate::vector::{VectorStore, VectorStoreError};

#[derive(Debug, thiserror::Error)]
pub enum RagDocumentError {
    #[error("backend {0:?} is not configured")]
    BackendUnavailable(RagBackendKind),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error(transparent)]
    Store(#[from] VectorStoreError),
}

/// A document as listed/returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub index_name: String,
    pub document_count: u64,
}

pub struct RagDocumentService {
    llm: Arc<dyn LlmClient>,
    qdrant: Option<Arc<dyn VectorStore>>,
    cache: Arc<dyn VectorStore>,
    embedding_model: String,
}

impl RagDocumentService {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        qdrant: Option<Arc<dyn VectorStore>>,
        cache: Arc<dyn VectorStore>,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            qdrant,
            cache,
            embedding_model: embedding_model.into(),
        }
    }

    fn backend(
        &self,
        kind: RagBackendKind,
    ) -> Result<Arc<dyn VectorStore>, RagDocumentError> {
        match kind {
            RagBackendKind::Qdrant => self
                .qdrant
                .clone()
                .ok_or(RagDocumentError::BackendUnavailable(kind)),
            RagBackendKind::Cache => Ok(self.cache.clone()),
        }
    }

    /// Embeds and upserts one document; a missing id gets a fresh UUID.
    pub async fn add_document(
        &self,
        index_name: &str,
        content: &str,
        metadata: serde_json::Value,
        document_id: Option<String>,
        backend: RagBackendKind,
    ) -> Result<String, RagDocumentError> {
        let store = self.backend(backend)?;
        let id = document_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let embedding = self
            .llm
            .embed(content, &self.embedding_model)
            .await
            .map_err(|e| RagDocumentError::Embedding(e.to_string()))?;
        store
            .upsert(
                index_name,
                &id,
                embedding,
                serde_json::json!({"content": content, "metadata": metadata}),
            )
            .await?;
        tracing::info!(index = index_name, document_id = %id, "document added");
        Ok(id)
    }

    pub async fn delete_document(
        &self,
        index_name: &str,
        document_id: &str,
        backend: RagBackendKind,
    ) -> Result<bool, RagDocumentError> {
        let store = self.backend(backend)?;
        Ok(store.delete(index_name, document_id).await?)
    }

    pub async fn document_exists(
        &self,
        index_name: &str,
        document_id: &str,
        backend: RagBackendKind,
    ) -> Result<bool, RagDocumentError> {
        let store = self.backend(backend)?;
        Ok(store.exists(index_name, document_id).await?)
    }

    pub async fn list_documents(
        &self,
        index_name: &str,
        limit: usize,
        backend: RagBackendKind,
    ) -> Result<Vec<DocumentView>, RagDocumentError> {
        let store = self.backend(backend)?;
        let (records, _cursor) = store.scroll(index_name, limit).await?;
        Ok(records
            .into_iter()
            .map(|record| DocumentView {
                id: record.id,
                content: record
                    .payload
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                metadata: record
                    .payload
                    .get("metadata")
                    .cloned()
                    .unwrap_or(serde_json::json!({})),
                score: None,
            })
            .collect())
    }

    pub async fn index_stats(
        &self,
        index_name: &str,
        backend: RagBackendKind,
    ) -> Result<IndexStats, RagDocumentError> {
        let store = self.backend(backend)?;
        Ok(IndexStats {
            index_name: index_name.to_string(),
            document_count: store.count(index_name).await?,
        })
    }

    pub async fn search_documents(
        &self,
        index_name: &str,
        query: &str,
        top_k: usize,
        backend: RagBackendKind,
    ) -> Result<Vec<DocumentView>, RagDocumentError> {
        let store = self.backend(backend)?;
        let embedding = self
            .llm
            .embed(query, &self.embedding_model)
            .await
            .map_err(|e| RagDocumentError::Embedding(e.to_string()))?;
        let hits = store.search(index_name, embedding, top_k).await?;
        Ok(hits
            .into_iter()
            .map(|hit| DocumentView {
                id: hit.id,
                content: hit
                    .payload
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                metadata: hit
                    .payload
                    .get("metadata")
                    .cloned()
                    .unwrap_or(serde_json::json!({})),
                score: Some(hit.score),
            })
            .collect())
    }

    /// Known collection names on the Qdrant backend (the cache backend keeps
    /// no index-of-indexes; registry bindings supplement this at the API).
    pub async fn list_backend_indexes(&self) -> Vec<String> {
        match self.qdrant {
            Some(ref store) => store.list_collections().await.unwrap_or_default(),
            None => Vec::new(),
        }
    }
}
