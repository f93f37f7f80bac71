//! Counters and rolling response-time windows, per agent and global.
//!
//! Everything lives in Redis under `metrics:*` keys with a 30-day TTL, so
//! reads never block the processing path and restarting the service keeps
//! recent history. All recording is best-effort: failures are logged, never
//! propagated into the request path.

use serde::Serialize;

use crate::queue::QueueClient;

const TTL_30_DAYS: i64 = 30 * 24 * 60 * 60;
const RESPONSE_TIME_WINDOW: isize = 1000;
const RESPONSE_TIME_AVG_SAMPLE: isize = 100;
const LOG_WINDOW: isize = 10_000;

#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub period_days: u32,
    pub messages: i64,
    pub tokens_used: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub success_rate: f64,
    pub avg_response_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalMetrics {
    pub period_days: u32,
    pub total_messages: i64,
    pub total_tokens: i64,
    pub avg_tokens_per_message: f64,
}

#[derive(Clone)]
pub struct MetricsService {
    cache: QueueClient,
}

impl MetricsService {
    pub fn new(cache: QueueClient) -> Self {
        Self { cache }
    }

    /// Records one processed message: counters, the response-time window,
    /// and a structured log entry.
    pub async fn record_message(
        &self,
        agent_id: &str,
        user_id: &str,
        channel: &str,
        response_time: f64,
        tokens_used: Option<u32>,
        success: bool,
    ) {
        self.bump(&format!("metrics:agent:{agent_id}:messages"), 1).await;
        if let Some(tokens) = tokens_used.filter(|t| *t > 0) {
            self.bump(&format!("metrics:agent:{agent_id}:tokens"), tokens as i64)
                .await;
            self.bump("metrics:global:tokens", tokens as i64).await;
        }
        let outcome_key = if success { "success" } else { "errors" };
        self.bump(&format!("metrics:agent:{agent_id}:{outcome_key}"), 1)
            .await;
        self.bump("metrics:global:messages", 1).await;

        if response_time > 0.0 {
            self.push_response_time(agent_id, response_time).await;
        }

        let entry = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "agent_id": agent_id,
            "user_id": user_id,
            "channel": channel,
            "response_time": response_time,
            "tokens_used": tokens_used,
            "success": success,
        });
        self.push_log("metrics:logs", &entry.to_string()).await;
    }

    pub async fn agent_metrics(&self, agent_id: &str, days: u32) -> AgentMetrics {
        let messages = self.counter(&format!("metrics:agent:{agent_id}:messages")).await;
        let tokens = self.counter(&format!("metrics:agent:{agent_id}:tokens")).await;
        let success = self.counter(&format!("metrics:agent:{agent_id}:success")).await;
        let errors = self.counter(&format!("metrics:agent:{agent_id}:errors")).await;

        let attempts = success + errors;
        let success_rate = if attempts == 0 {
            0.0
        } else {
            round3(success as f64 / attempts as f64)
        };

        AgentMetrics {
            agent_id: agent_id.to_string(),
            period_days: days,
            messages,
            tokens_used: tokens,
            success_count: success,
            error_count: errors,
            success_rate,
            avg_response_time: round3(self.avg_response_time(agent_id).await),
        }
    }

    pub async fn global_metrics(&self, days: u32) -> GlobalMetrics {
        let messages = self.counter("metrics:global:messages").await;
        let tokens = self.counter("metrics:global:tokens").await;
        GlobalMetrics {
            period_days: days,
            total_messages: messages,
            total_tokens: tokens,
            avg_tokens_per_message: if messages > 0 {
                tokens as f64 / messages as f64
            } else {
                0.0
            },
        }
    }

    async fn bump(&self, key: &str, delta: i64) {
        if let Err(e) = self.cache.incr_by(key, delta).await {
            tracing::error!(key, error = %e, "failed to increment counter");
            return;
        }
        let _ = self.cache.expire(key, TTL_30_DAYS).await;
    }

    async fn counter(&self, key: &str) -> i64 {
        self.cache.get_counter(key).await.unwrap_or(0)
    }

    async fn push_response_time(&self, agent_id: &str, response_time: f64) {
        let key = format!("metrics:agent:{agent_id}:response_times");
        if let Err(e) = self.cache.lpush(&key, &response_time.to_string()).await {
            tracing::error!(agent_id, error = %e, "failed to record response time");
            return;
        }
        let _ = self.cache.ltrim(&key, 0, RESPONSE_TIME_WINDOW - 1).await;
        let _ = self.cache.expire(&key, TTL_30_DAYS).await;
    }

    async fn avg_response_time(&self, agent_id: &str) -> f64 {
        let key = format!("metrics:agent:{agent_id}:response_times");
        let raw = self
            .cache
            .lrange(&key, 0, RESPONSE_TIME_AVG_SAMPLE - 1)
            .await
            .unwrap_or_default();
        let times: Vec<f64> = raw.iter().filter_map(|t| t.parse().ok()).collect();
        if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        }
    }

    async fn push_log(&self, key: &str, entry: &str) {
        if self.cache.lpush(key, entry).await.is_ok() {
            let _ = self.cache.ltrim(key, 0, LOG_WINDOW - 1).await;
            let _ = self.cache.expire(key, TTL_30_DAYS).await;
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}
