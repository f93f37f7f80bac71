//! Vector-index document operations: CRUD, similarity search, stats, and
//! text-file ingestion with deterministic chunk ids.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use weft::agent::RagBackendKind;
use weft::rag::ingest;

use crate::app::Container;
use crate::error::ApiError;

pub fn router() -> Router<Arc<Container>> {
    Router::new()
        .route("/rag/indexes", get(list_indexes))
        .route(
            "/rag/:index_name/documents",
            get(list_documents).post(create_document),
        )
        .route(
            "/rag/:index_name/documents/:document_id",
            axum::routing::delete(delete_document),
        )
        .route("/rag/:index_name/search", post(search_documents))
        .route("/rag/:index_name/stats", get(index_stats))
        .route("/rag/:index_name/files", post(upload_text_file))
}

#[derive(Deserialize)]
struct BackendQuery {
    #[serde(default)]
    backend: Option<RagBackendKind>,
}

impl BackendQuery {
    fn kind(&self) -> RagBackendKind {
        self.backend.unwrap_or(RagBackendKind::Qdrant)
    }
}

/// Union of the collections the backend knows and the indexes agents bind.
async fn list_indexes(
    State(container): State<Arc<Container>>,
) -> Json<serde_json::Value> {
    let mut indexes: BTreeSet<String> = container
        .registry
        .list()
        .into_values()
        .filter_map(|agent| agent.rag.map(|rag| rag.index_name))
        .collect();
    for name in container.rag_documents.list_backend_indexes().await {
        indexes.insert(name);
    }
    Json(serde_json::json!({ "indexes": indexes }))
}

#[derive(Deserialize)]
struct DocumentCreate {
    content: String,
    #[serde(default)]
    metadata: serde_json::Value,
    #[serde(default)]
    document_id: Option<String>,
}

async fn create_document(
    State(container): State<Arc<Container>>,
    Path(index_name): Path<String>,
    Query(backend): Query<BackendQuery>,
    Json(body): Json<DocumentCreate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.content.trim().is_empty() {
        return Err(ApiError::Validation("content must not be empty".into()));
    }
    let document_id = container
        .rag_documents
        .add_document(
            &index_name,
            &body.content,
            body.metadata,
            body.document_id,
            backend.kind(),
        )
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "status": "created",
        "document_id": document_id,
        "index_name": index_name,
    })))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    backend: Option<RagBackendKind>,
}

fn default_limit() -> usize {
    100
}

async fn list_documents(
    State(container): State<Arc<Container>>,
    Path(index_name): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let documents = container
        .rag_documents
        .list_documents(
            &index_name,
            query.limit,
            query.backend.unwrap_or(RagBackendKind::Qdrant),
        )
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "index_name": index_name,
        "count": documents.len(),
        "documents": documents,
    })))
}

async fn delete_document(
    State(container): State<Arc<Container>>,
    Path((index_name, document_id)): Path<(String, String)>,
    Query(backend): Query<BackendQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = container
        .rag_documents
        .delete_document(&index_name, &document_id, backend.kind())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !deleted {
        return Err(ApiError::NotFound("Document not found".into()));
    }
    Ok(Json(serde_json::json!({"status": "deleted", "document_id": document_id})))
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: u32,
    #[serde(default)]
    backend: Option<RagBackendKind>,
}

fn default_top_k() -> u32 {
    5
}

async fn search_documents(
    State(container): State<Arc<Container>>,
    Path(index_name): Path<String>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let results = container
        .rag_documents
        .search_documents(
            &index_name,
            &body.query,
            body.top_k as usize,
            body.backend.unwrap_or(RagBackendKind::Qdrant),
        )
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "index_name": index_name,
        "query": body.query,
        "results": results,
    })))
}

async fn index_stats(
    State(container): State<Arc<Container>>,
    Path(index_name): Path<String>,
    Query(backend): Query<BackendQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = container
        .rag_documents
        .index_stats(&index_name, backend.kind())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

/// Ingests an uploaded text file: chunk, derive stable per-chunk ids from
/// the file hash, embed, and upsert. Binary-format extraction is handled
/// by external tooling; this endpoint takes UTF-8 text (`.txt`, `.md`).
async fn upload_text_file(
    State(container): State<Arc<Container>>,
    Path(index_name): Path<String>,
    Query(backend): Query<BackendQuery>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.txt").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        if bytes.is_empty() {
            return Err(ApiError::BadRequest("Empty file".into()));
        }
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| ApiError::Validation("file must be UTF-8 text".into()))?;

        let chunks = ingest::chunk_text(text, 1500, 300);
        if chunks.is_empty() {
            return Err(ApiError::BadRequest("No text extracted from file".into()));
        }

        let file_hash = ingest::file_sha256(&bytes);
        let total = chunks.len();
        let mut document_ids = Vec::with_capacity(total);
        for (i, chunk) in chunks.iter().enumerate() {
            let document_id = ingest::chunk_document_id(&index_name, &file_hash, i);
            let metadata = serde_json::json!({
                "source_file": filename,
                "file_size": bytes.len(),
                "file_hash_sha256": file_hash,
                "chunk_index": i,
                "total_chunks": total,
                "file_type": std::path::Path::new(&filename)
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default(),
            });
            container
                .rag_documents
                .add_document(&index_name, chunk, metadata, Some(document_id.clone()), backend.kind())
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            document_ids.push(document_id);
        }

        return Ok(Json(serde_json::json!({
            "status": "uploaded",
            "index_name": index_name,
            "filename": filename,
            "chunks": total,
            "document_ids": document_ids,
        })));
    }
    Err(ApiError::BadRequest("multipart field 'file' is required".into()))
}
