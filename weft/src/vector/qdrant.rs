//! Qdrant-backed [`VectorStore`]: persistent server-side cosine ANN.

use async_trait::async_trait;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, GetPointsBuilder,
    PointId, PointStruct, PointsIdsList, ScrollPointsBuilder, SearchPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};

use super::{VectorHit, VectorRecord, VectorStore, VectorStoreError};

/// Qdrant client wrapper. Connection performs a warm-up loop so the service
/// can start before the vector DB container is ready.
pub struct QdrantStore {
    client: Qdrant,
}

const CONNECT_ATTEMPTS: usize = 30;

impl QdrantStore {
    /// Builds the client and waits (up to 30 × 1 s) for the server to answer
    /// a `list_collections` probe.
    pub async fn connect(url: &str, api_key: Option<String>) -> Result<Self, VectorStoreError> {
        let client = Qdrant::from_url(url)
            .api_key(api_key)
            .build()
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;

        let mut last_error = String::new();
        for attempt in 0..CONNECT_ATTEMPTS {
            match client.list_collections().await {
                Ok(_) => {
                    tracing::info!(url, "connected to Qdrant");
                    return Ok(Self { client });
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::debug!(url, attempt, error = %last_error, "Qdrant not ready");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
        Err(VectorStoreError::Backend(format!(
            "failed to connect to Qdrant at {url}: {last_error}"
        )))
    }

    fn payload_from_json(value: serde_json::Value) -> Result<Payload, VectorStoreError> {
        Payload::try_from(value).map_err(|e| VectorStoreError::Backend(e.to_string()))
    }
}

fn point_id_to_string(id: Option<PointId>) -> String {
    match id.and_then(|p| p.point_id_options) {
        Some(PointIdOptions::Uuid(s)) => s,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    }
}

fn qdrant_value_to_json(value: qdrant_client::qdrant::Value) -> serde_json::Value {
    match value.kind {
        Some(Kind::NullValue(_)) | None => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => {
            serde_json::Number::from_f64(d).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => serde_json::Value::Array(
            list.values.into_iter().map(qdrant_value_to_json).collect(),
        ),
        Some(Kind::StructValue(st)) => serde_json::Value::Object(
            st.fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_value_to_json(v)))
                .collect(),
        ),
    }
}

fn payload_to_json(
    payload: std::collections::HashMap<String, qdrant_client::qdrant::Value>,
) -> serde_json::Value {
    serde_json::Value::Object(
        payload
            .into_iter()
            .map(|(k, v)| (k, qdrant_value_to_json(v)))
            .collect(),
    )
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), VectorStoreError> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;
        if exists {
            return Ok(());
        }
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;
        tracing::info!(collection = name, dim, "created Qdrant collection");
        Ok(())
    }

    async fn upsert(
        &self,
        name: &str,
        id: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
    ) -> Result<(), VectorStoreError> {
        self.ensure_collection(name, vector.len()).await?;
        let point = PointStruct::new(
            id.to_string(),
            vector,
            Self::payload_from_json(payload)?,
        );
        self.client
            .upsert_points(UpsertPointsBuilder::new(name, vec![point]).wait(true))
            .await
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, name: &str, id: &str) -> Result<bool, VectorStoreError> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(name)
                    .points(PointsIdsList {
                        ids: vec![id.to_string().into()],
                    })
                    .wait(true),
            )
            .await
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;
        Ok(true)
    }

    async fn count(&self, name: &str) -> Result<u64, VectorStoreError> {
        let response = self
            .client
            .count(CountPointsBuilder::new(name).exact(true))
            .await
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    async fn scroll(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<(Vec<VectorRecord>, Option<String>), VectorStoreError> {
        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(name)
                    .limit(limit as u32)
                    .with_payload(true)
                    .with_vectors(false),
            )
            .await
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;

        let records = response
            .result
            .into_iter()
            .map(|p| VectorRecord {
                id: point_id_to_string(p.id),
                payload: payload_to_json(p.payload),
            })
            .collect();
        let next = response
            .next_page_offset
            .map(|p| point_id_to_string(Some(p)));
        Ok((records, next))
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
        self.ensure_collection(name, vector.len()).await?;
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(name, vector, top_k as u64).with_payload(true),
            )
            .await
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;

        Ok(response
            .result
            .into_iter()
            .map(|p| VectorHit {
                id: point_id_to_string(p.id),
                score: p.score,
                payload: payload_to_json(p.payload),
            })
            .collect())
    }

    async fn exists(&self, name: &str, id: &str) -> Result<bool, VectorStoreError> {
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(name, vec![id.to_string().into()]).with_payload(false),
            )
            .await
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;
        Ok(!response.result.is_empty())
    }

    async fn list_collections(&self) -> Result<Vec<String>, VectorStoreError> {
        let response = self
            .client
            .list_collections()
            .await
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;
        let mut names: Vec<String> = response
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_render_as_strings() {
        let uuid = PointId {
            point_id_options: Some(PointIdOptions::Uuid("abc-123".into())),
        };
        assert_eq!(point_id_to_string(Some(uuid)), "abc-123");
        let num = PointId {
            point_id_options: Some(PointIdOptions::Num(7)),
        };
        assert_eq!(point_id_to_string(Some(num)), "7");
        assert_eq!(point_id_to_string(None), "");
    }

    /// **Scenario**: full lifecycle against a live Qdrant — ensure is
    /// idempotent, upsert/search/scroll/count/delete agree.
    #[tokio::test]
    #[ignore = "Requires a local Qdrant; run with: cargo test -p weft qdrant_lifecycle -- --ignored"]
    async fn qdrant_lifecycle() {
        let store = QdrantStore::connect("http://localhost:6334", None)
            .await
            .unwrap();
        let name = "weft_test_collection";
        store.ensure_collection(name, 3).await.unwrap();
        store.ensure_collection(name, 3).await.unwrap();

        let id = uuid::Uuid::new_v4().to_string();
        store
            .upsert(
                name,
                &id,
                vec![1.0, 0.0, 0.0],
                serde_json::json!({"content": "doc", "metadata": {}}),
            )
            .await
            .unwrap();
        assert!(store.exists(name, &id).await.unwrap());
        assert!(store.count(name).await.unwrap() >= 1);

        let hits = store.search(name, vec![1.0, 0.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].payload["content"], "doc");

        assert!(store.delete(name, &id).await.unwrap());
    }
}
