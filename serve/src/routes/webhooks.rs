//! Webhook ingress: normalize and sanitize the body, then either stream
//! the turn over SSE or enqueue a durable job.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use weft::agent::AgentConfig;
use weft::message::{Channel, HistoryEntry, InboundMessage};
use weft::queue::JobDraft;

use crate::app::Container;
use crate::error::ApiError;
use crate::sanitize::{sanitize_str, sanitize_value};

pub fn router() -> Router<Arc<Container>> {
    Router::new()
        .route("/webhooks/agent/:agent_id", post(webhook_by_agent_id))
        .route("/webhooks/:webhook_name", post(webhook_by_name))
}

async fn webhook_by_agent_id(
    State(container): State<Arc<Container>>,
    Path(agent_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let agent = container
        .registry
        .get(&agent_id)
        .ok_or_else(|| ApiError::NotFound(format!("Agent {agent_id} not found")))?;
    dispatch(container, agent, body).await
}

async fn webhook_by_name(
    State(container): State<Arc<Container>>,
    Path(webhook_name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let agent = container
        .registry
        .get_by_webhook_name(&webhook_name)
        .ok_or_else(|| ApiError::NotFound(format!("Webhook {webhook_name} not found")))?;
    dispatch(container, agent, body).await
}

/// Normalized, sanitized view of the webhook body.
struct ParsedBody {
    message: InboundMessage,
    history: Vec<HistoryEntry>,
    stream: bool,
}

fn parse_body(body: serde_json::Value) -> ParsedBody {
    let channel = body
        .get("channel")
        .and_then(|v| serde_json::from_value::<Channel>(v.clone()).ok())
        .unwrap_or_default();
    let text = sanitize_str(body.get("text").and_then(|v| v.as_str()).unwrap_or_default());
    let user_id = sanitize_str(
        body.get("user_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown"),
    );
    let conversation_id = body
        .get("conversation_id")
        .and_then(|v| v.as_str())
        .map(sanitize_str);
    let metadata = match body.get("metadata").cloned().map(sanitize_value) {
        Some(serde_json::Value::Object(map)) => map,
        _ => Default::default(),
    };
    let history = body
        .get("history")
        .cloned()
        .map(sanitize_value)
        .and_then(|v| serde_json::from_value::<Vec<HistoryEntry>>(v).ok())
        .unwrap_or_default();
    let stream = body
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    ParsedBody {
        message: InboundMessage {
            user_id,
            channel,
            text,
            metadata,
            conversation_id,
        },
        history,
        stream,
    }
}

async fn dispatch(
    container: Arc<Container>,
    agent: AgentConfig,
    body: serde_json::Value,
) -> Result<Response, ApiError> {
    let parsed = parse_body(body);
    if parsed.stream {
        let headers = [
            (axum::http::header::CACHE_CONTROL, "no-cache"),
            (axum::http::header::CONNECTION, "keep-alive"),
        ];
        Ok((headers, stream_response(container, agent, parsed)).into_response())
    } else {
        enqueue_response(container, agent, parsed).await
    }
}

/// SSE path: every content chunk becomes one `data: <json-string>` frame.
/// Client disconnect drops the receiver stream, which cancels the turn's
/// sends and lets the LLM stream stop.
fn stream_response(
    container: Arc<Container>,
    agent: AgentConfig,
    parsed: ParsedBody,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (chunk_tx, chunk_rx) = tokio::sync::mpsc::channel::<String>(64);

    tokio::spawn(async move {
        container
            .agent_service
            .run_turn_streaming(&agent, &parsed.message, &parsed.history, chunk_tx)
            .await;
    });

    let stream = ReceiverStream::new(chunk_rx).map(|chunk| {
        let payload = serde_json::to_string(&chunk)
            .unwrap_or_else(|e| format!("\"[ERRO: {e}]\""));
        Ok(Event::default().data(payload))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn enqueue_response(
    container: Arc<Container>,
    agent: AgentConfig,
    parsed: ParsedBody,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let agent_id = agent.id.clone();
    let user_id = parsed.message.user_id.clone();
    let channel = parsed.message.channel;

    let enqueued = container
        .queue
        .enqueue(JobDraft {
            agent_id: agent_id.clone(),
            message: parsed.message,
            history: parsed.history,
            webhook_output_url: agent.webhook_output_url.clone(),
        })
        .await;

    let success = enqueued.is_ok();
    container
        .metrics
        .record_message(
            &agent_id,
            &user_id,
            channel.as_str(),
            started.elapsed().as_secs_f64(),
            None,
            success,
        )
        .await;

    let job_id = enqueued.map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "status": "enqueued",
        "job_id": job_id,
        "agent_id": agent_id,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_defaults_fill_in_for_missing_fields() {
        let parsed = parse_body(serde_json::json!({"text": "hi"}));
        assert_eq!(parsed.message.text, "hi");
        assert_eq!(parsed.message.user_id, "unknown");
        assert_eq!(parsed.message.channel, Channel::Web);
        assert!(!parsed.stream);
        assert!(parsed.history.is_empty());
    }

    #[test]
    fn body_strings_are_sanitized_including_history() {
        let parsed = parse_body(serde_json::json!({
            "text": "<script>x</script>hello",
            "user_id": "<iframe>u</iframe>1",
            "metadata": {"note": "<script>y</script>safe"},
            "history": [
                {"role": "user", "content": "<script>z</script>before"},
                {"role": "assistant", "content": "fine"},
            ],
            "stream": true,
        }));
        assert_eq!(parsed.message.text, "hello");
        assert_eq!(parsed.message.user_id, "1");
        assert_eq!(parsed.message.metadata["note"], "safe");
        assert_eq!(parsed.history[0].content, "before");
        assert!(parsed.stream);
    }

    #[test]
    fn unknown_channel_falls_back_to_web() {
        let parsed = parse_body(serde_json::json!({"text": "t", "channel": "carrier-pigeon"}));
        assert_eq!(parsed.message.channel, Channel::Web);
        let parsed = parse_body(serde_json::json!({"text": "t", "channel": "slack"}));
        assert_eq!(parsed.message.channel, Channel::Slack);
    }
}
