//! Metrics read endpoints: per-agent and global aggregates.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::app::Container;
use crate::error::ApiError;

pub fn router() -> Router<Arc<Container>> {
    Router::new()
        .route("/metrics/agents/:agent_id", get(agent_metrics))
        .route("/metrics/global", get(global_metrics))
}

#[derive(Deserialize)]
struct DaysQuery {
    #[serde(default = "default_days")]
    days: u32,
}

fn default_days() -> u32 {
    7
}

async fn agent_metrics(
    State(container): State<Arc<Container>>,
    Path(agent_id): Path<String>,
    Query(query): Query<DaysQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if container.registry.get(&agent_id).is_none() {
        return Err(ApiError::NotFound(format!("Agent {agent_id} not found")));
    }
    let report = container.metrics.agent_metrics(&agent_id, query.days).await;
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}

async fn global_metrics(
    State(container): State<Arc<Container>>,
    Query(query): Query<DaysQuery>,
) -> Json<serde_json::Value> {
    let report = container.metrics.global_metrics(query.days).await;
    Json(serde_json::to_value(report).unwrap_or_default())
}
