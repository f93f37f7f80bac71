//! Agent registry operations, tabular file management, and the data-query
//! endpoint. All of these sit behind the auth middleware; visibility and
//! mutation rights follow the RBAC rules.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;

use weft::agent::AgentConfig;
use weft::auth::{require_admin_grupo, AuthUser, UserLevel};

use crate::app::Container;
use crate::error::ApiError;

pub fn router() -> Router<Arc<Container>> {
    Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/create", post(create_agent))
        .route("/agents/reload", post(reload_all))
        .route("/agents/:agent_id", get(get_agent).delete(delete_agent))
        .route("/agents/:agent_id/reload", post(reload_one))
        .route(
            "/agents/:agent_id/files",
            get(list_files).post(upload_file),
        )
        .route("/agents/:agent_id/files/:filename", delete(delete_file))
        .route("/agents/:agent_id/data/query", post(data_query))
}

/// Fetches an agent and enforces group visibility.
fn visible_agent(
    container: &Container,
    user: &AuthUser,
    agent_id: &str,
) -> Result<AgentConfig, ApiError> {
    let agent = container
        .registry
        .get(agent_id)
        .ok_or_else(|| ApiError::NotFound(format!("Agent {agent_id} not found")))?;
    if !user.can_see_agent(agent.group_id.as_deref()) {
        return Err(ApiError::Forbidden);
    }
    Ok(agent)
}

async fn list_agents(
    State(container): State<Arc<Container>>,
    Extension(user): Extension<AuthUser>,
) -> Json<serde_json::Value> {
    let mut agents: Vec<serde_json::Value> = container
        .registry
        .list()
        .into_values()
        .filter(|agent| user.can_see_agent(agent.group_id.as_deref()))
        .map(|agent| {
            serde_json::json!({
                "id": agent.id,
                "nome": agent.name,
                "model": agent.model,
                "has_rag": agent.rag.is_some(),
                "tools_count": agent.tools.len(),
                "webhook_name": agent.webhook_name,
            })
        })
        .collect();
    agents.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    Json(serde_json::json!({ "agents": agents }))
}

async fn get_agent(
    State(container): State<Arc<Container>>,
    Extension(user): Extension<AuthUser>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentConfig>, ApiError> {
    Ok(Json(visible_agent(&container, &user, &agent_id)?))
}

async fn create_agent(
    State(container): State<Arc<Container>>,
    Extension(user): Extension<AuthUser>,
    Json(mut agent): Json<AgentConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin_grupo(&user)?;
    // Group admins can only create agents inside their own group.
    if user.level != UserLevel::AdminGeral {
        agent.group_id = user.group_id.clone();
    }
    let agent_id = agent.id.clone();
    container.registry.save(agent)?;
    Ok(Json(serde_json::json!({"status": "created", "agent_id": agent_id})))
}

async fn delete_agent(
    State(container): State<Arc<Container>>,
    Extension(user): Extension<AuthUser>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin_grupo(&user)?;
    visible_agent(&container, &user, &agent_id)?;
    container.registry.delete(&agent_id)?;
    Ok(Json(serde_json::json!({"status": "deleted", "agent_id": agent_id})))
}

/// Reloading one agent re-reads the whole store; file/DB reconciliation is
/// not done per id.
async fn reload_one(
    State(container): State<Arc<Container>>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let found = container.registry.reload_one(&agent_id)?;
    if !found {
        return Err(ApiError::NotFound(format!("Agent {agent_id} not found")));
    }
    if let Some(agent) = container.registry.get(&agent_id) {
        if let Some(ref binding) = agent.data_analysis {
            if binding.enabled && !binding.files.is_empty() {
                container.data.load_agent_files(&agent_id, &binding.files);
            }
        }
    }
    Ok(Json(serde_json::json!({"status": "reloaded", "agent_id": agent_id})))
}

async fn reload_all(
    State(container): State<Arc<Container>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = container
        .load_agents()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({"status": "reloaded", "count": count})))
}

async fn list_files(
    State(container): State<Arc<Container>>,
    Extension(user): Extension<AuthUser>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    visible_agent(&container, &user, &agent_id)?;
    let files = container.data.list_files(&agent_id);
    Ok(Json(serde_json::json!({"agent_id": agent_id, "files": files})))
}

async fn upload_file(
    State(container): State<Arc<Container>>,
    Extension(user): Extension<AuthUser>,
    Path(agent_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin_grupo(&user)?;
    visible_agent(&container, &user, &agent_id)?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest("file field needs a filename".into()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        if bytes.is_empty() {
            return Err(ApiError::BadRequest("Empty file".into()));
        }

        let info = container
            .data
            .save_file(&agent_id, &filename, &bytes)
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        return Ok(Json(serde_json::json!({"status": "uploaded", "file": info})));
    }
    Err(ApiError::BadRequest("multipart field 'file' is required".into()))
}

async fn delete_file(
    State(container): State<Arc<Container>>,
    Extension(user): Extension<AuthUser>,
    Path((agent_id, filename)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin_grupo(&user)?;
    visible_agent(&container, &user, &agent_id)?;
    let deleted = container
        .data
        .delete_file(&agent_id, &filename)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !deleted {
        return Err(ApiError::NotFound(format!("File {filename} not found")));
    }
    Ok(Json(serde_json::json!({"status": "deleted", "filename": filename})))
}

#[derive(Deserialize)]
struct DataQueryRequest {
    query: String,
}

/// Runs one restricted query against the agent's loaded frames. The
/// tabular engine is blocking, so it runs on the blocking pool.
async fn data_query(
    State(container): State<Arc<Container>>,
    Extension(user): Extension<AuthUser>,
    Path(agent_id): Path<String>,
    Json(body): Json<DataQueryRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    visible_agent(&container, &user, &agent_id)?;
    let data = container.data.clone();
    let query = body.query.clone();
    let id = agent_id.clone();
    let outcome = tokio::task::spawn_blocking(move || data.execute_query(&id, &query))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "agent_id": agent_id,
        "query": body.query,
        "result": outcome,
    })))
}
