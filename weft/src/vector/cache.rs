//! Cache-backed [`VectorStore`]: documents and embeddings stored as Redis
//! keys with brute-force cosine search.
//!
//! Layout per index:
//! - `rag:doc:<index>:<id>` — hash `{content, metadata}`
//! - `rag:embedding:<index>:<id>` — JSON vector, 30-day TTL
//! - `rag:index:<index>:documents` — membership set
//!
//! Search loads member embeddings in batches of 200 per MGET round-trip to
//! bound latency, scores them with cosine similarity, sorts descending, and
//! returns the top-k.

use async_trait::async_trait;

use super::{cosine_similarity, VectorHit, VectorRecord, VectorStore, VectorStoreError};
use crate::queue::QueueClient;

const TTL_30_DAYS: u64 = 30 * 24 * 60 * 60;
const SEARCH_BATCH: usize = 200;

pub struct CacheVectorStore {
    cache: QueueClient,
}

impl CacheVectorStore {
    pub fn new(cache: QueueClient) -> Self {
        Self { cache }
    }

    fn doc_key(index: &str, id: &str) -> String {
        format!("rag:doc:{index}:{id}")
    }

    fn embedding_key(index: &str, id: &str) -> String {
        format!("rag:embedding:{index}:{id}")
    }

    fn members_key(index: &str) -> String {
        format!("rag:index:{index}:documents")
    }

    async fn load_record(
        &self,
        index: &str,
        id: &str,
    ) -> Result<Option<VectorRecord>, VectorStoreError> {
        let fields = self.cache.hgetall(&Self::doc_key(index, id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let metadata = fields
            .get("metadata")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null);
        Ok(Some(VectorRecord {
            id: id.to_string(),
            payload: serde_json::json!({
                "content": fields.get("content").cloned().unwrap_or_default(),
                "metadata": metadata,
            }),
        }))
    }
}

#[async_trait]
impl VectorStore for CacheVectorStore {
    /// Collections are implicit key prefixes; nothing to create.
    async fn ensure_collection(&self, _name: &str, _dim: usize) -> Result<(), VectorStoreError> {
        Ok(())
    }

    async fn upsert(
        &self,
        name: &str,
        id: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
    ) -> Result<(), VectorStoreError> {
        let content = payload
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let metadata = payload
            .get("metadata")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        self.cache
            .hset_all(
                &Self::doc_key(name, id),
                &[
                    ("content", content),
                    ("metadata", serde_json::to_string(&metadata)?),
                ],
            )
            .await?;
        self.cache
            .set_json(&Self::embedding_key(name, id), &vector, TTL_30_DAYS)
            .await?;
        let members = Self::members_key(name);
        self.cache.sadd(&members, id).await?;
        self.cache.expire(&members, TTL_30_DAYS as i64).await?;
        Ok(())
    }

    async fn delete(&self, name: &str, id: &str) -> Result<bool, VectorStoreError> {
        let existed = self.cache.exists(&Self::doc_key(name, id)).await?;
        self.cache.del(&Self::doc_key(name, id)).await?;
        self.cache.del(&Self::embedding_key(name, id)).await?;
        self.cache.srem(&Self::members_key(name), id).await?;
        Ok(existed)
    }

    async fn count(&self, name: &str) -> Result<u64, VectorStoreError> {
        Ok(self.cache.scard(&Self::members_key(name)).await?)
    }

    async fn scroll(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<(Vec<VectorRecord>, Option<String>), VectorStoreError> {
        let mut ids = self.cache.smembers(&Self::members_key(name)).await?;
        ids.sort();
        let mut records = Vec::new();
        for id in ids.iter().take(limit) {
            if let Some(record) = self.load_record(name, id).await? {
                records.push(record);
            }
        }
        // Set members have no stable cursor; callers page by raising limit.
        Ok((records, None))
    }

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<VectorHit>, VectorStoreError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let ids = self.cache.smembers(&Self::members_key(name)).await?;
        let mut scored: Vec<(String, f32)> = Vec::with_capacity(ids.len());

        for batch in ids.chunks(SEARCH_BATCH) {
            let keys: Vec<String> = batch
                .iter()
                .map(|id| Self::embedding_key(name, id))
                .collect();
            let values = self.cache.mget(&keys).await?;
            for (id, raw) in batch.iter().zip(values) {
                let Some(raw) = raw else { continue };
                let Ok(embedding) = serde_json::from_str::<Vec<f32>>(&raw) else {
                    continue;
                };
                scored.push((id.clone(), cosine_similarity(&vector, &embedding)));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        let mut hits = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            if let Some(record) = self.load_record(name, &id).await? {
                hits.push(VectorHit {
                    id,
                    score,
                    payload: record.payload,
                });
            }
        }
        Ok(hits)
    }

    async fn exists(&self, name: &str, id: &str) -> Result<bool, VectorStoreError> {
        Ok(self.cache.exists(&Self::doc_key(name, id)).await?)
    }

    async fn list_collections(&self) -> Result<Vec<String>, VectorStoreError> {
        // The cache keeps no index-of-indexes; registry bindings enumerate
        // the known collections at the API layer.
        Ok(Vec::new())
    }
}
