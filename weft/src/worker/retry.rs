//! Opt-in retry schedule for failed jobs.
//!
//! Jobs are always acked by the worker (at-least-once without head-of-line
//! blocking); when retry is enabled, failures are recorded here instead:
//! the job payload under a 24 h key, and a sorted-set entry scoring the
//! next attempt at `now + 2^attempt minutes`. After `max_retries` the job
//! moves to the dead-letter list, capped at 10 000 entries.

use crate::message::Job;
use crate::queue::{QueueClient, QueueError};

const RETRY_QUEUE_KEY: &str = "retry:queue";
const DLQ_KEY: &str = "dlq:jobs";
const DLQ_WINDOW: isize = 10_000;
const FAILED_JOB_TTL_SECS: u64 = 24 * 60 * 60;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct RetryService {
    cache: QueueClient,
    max_retries: u32,
}

impl RetryService {
    pub fn new(cache: QueueClient) -> Self {
        Self {
            cache,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn failed_key(job_id: &str) -> String {
        format!("retry:failed:{job_id}")
    }

    /// Failures so far for a job, from its stored retry record.
    async fn attempts_so_far(&self, job_id: &str) -> u32 {
        self.cache
            .get_json::<serde_json::Value>(&Self::failed_key(job_id))
            .await
            .ok()
            .flatten()
            .and_then(|entry| entry["attempt"].as_u64())
            .unwrap_or(0) as u32
    }

    /// Records a failed job for a later attempt, or dead-letters it once
    /// the attempt budget is spent. The attempt count lives in the stored
    /// record, so re-failures of a retried job keep escalating the backoff.
    pub async fn record_failure(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let attempt = self.attempts_so_far(&job.job_id).await;
        if attempt >= self.max_retries {
            self.forget(&job.job_id).await?;
            return self.dead_letter(job, error).await;
        }

        let entry = serde_json::json!({
            "job": job,
            "error": error,
            "attempt": attempt + 1,
            "failed_at": chrono::Utc::now().to_rfc3339(),
        });
        self.cache
            .set_json(&Self::failed_key(&job.job_id), &entry, FAILED_JOB_TTL_SECS)
            .await?;

        let delay_secs = 2f64.powi(attempt as i32) * 60.0;
        let due_at = chrono::Utc::now().timestamp() as f64 + delay_secs;
        self.cache.zadd(RETRY_QUEUE_KEY, &job.job_id, due_at).await?;
        tracing::info!(
            job_id = %job.job_id,
            agent_id = %job.agent_id,
            attempt = attempt + 1,
            delay_secs,
            "job scheduled for retry"
        );
        Ok(())
    }

    /// Re-appends jobs whose retry time has come, keeping their ids so the
    /// attempt record carries over. Returns how many went back into the
    /// stream.
    pub async fn drain_due(&self, queue: &QueueClient, limit: usize) -> Result<usize, QueueError> {
        let now = chrono::Utc::now().timestamp() as f64;
        let due = self
            .cache
            .zrangebyscore(RETRY_QUEUE_KEY, now, limit as isize)
            .await?;

        let mut requeued = 0usize;
        for job_id in due {
            let key = Self::failed_key(&job_id);
            let Some(entry) = self.cache.get_json::<serde_json::Value>(&key).await? else {
                self.cache.zrem(RETRY_QUEUE_KEY, &job_id).await?;
                continue;
            };
            let Ok(job) = serde_json::from_value::<Job>(entry["job"].clone()) else {
                tracing::error!(job_id = %job_id, "undecodable retry entry, dropping");
                self.cache.zrem(RETRY_QUEUE_KEY, &job_id).await?;
                self.cache.del(&key).await?;
                continue;
            };

            queue.requeue(&job).await?;
            // The failed record stays until the job finally succeeds, so a
            // re-failure sees the accumulated attempt count.
            self.cache.zrem(RETRY_QUEUE_KEY, &job_id).await?;
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Clears a retry entry after the job finally succeeded.
    pub async fn forget(&self, job_id: &str) -> Result<(), QueueError> {
        self.cache.zrem(RETRY_QUEUE_KEY, job_id).await?;
        self.cache.del(&Self::failed_key(job_id)).await?;
        Ok(())
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let entry = serde_json::json!({
            "job_id": job.job_id,
            "agent_id": job.agent_id,
            "error": error,
            "failed_at": chrono::Utc::now().to_rfc3339(),
            "retry_count": self.max_retries,
        });
        self.cache.lpush(DLQ_KEY, &entry.to_string()).await?;
        self.cache.ltrim(DLQ_KEY, 0, DLQ_WINDOW - 1).await?;
        tracing::warn!(
            job_id = %job.job_id,
            agent_id = %job.agent_id,
            "job moved to dead-letter queue after {} retries",
            self.max_retries
        );
        Ok(())
    }
}
