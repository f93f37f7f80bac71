//! Redis-backed queue client: log-stream job queue with consumer groups,
//! pub/sub notifications, and the key-value/counter/list/set primitives the
//! metrics and retry services build on.
//!
//! Delivery is at-least-once: jobs are XADD'ed to a stream, read through a
//! consumer group with a blocking timeout, and acknowledged per message.
//! Workers ack even on failure (retry runs through a separate schedule, see
//! [`crate::worker::retry`]) so one poisoned job cannot block the group.

mod error;

pub use error::QueueError;

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use uuid::Uuid;

use crate::message::Job;

/// Default consumer group shared by the worker pool.
pub const DEFAULT_GROUP: &str = "workers";

/// A job handed to a consumer, tagged with the stream entry id to ack.
#[derive(Debug, Clone)]
pub struct DeliveredJob {
    pub msg_id: String,
    pub job: Job,
}

/// Fields accepted by [`QueueClient::enqueue`]; `job_id` and `created_at`
/// are stamped at append time.
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub agent_id: String,
    pub message: crate::message::InboundMessage,
    pub history: Vec<crate::message::HistoryEntry>,
    pub webhook_output_url: Option<String>,
}

/// Async Redis client over one multiplexed connection.
///
/// Cheap to clone; every method takes `&self`. All errors are surfaced as
/// [`QueueError`] — callers on the hot path (metrics, pub/sub) treat them as
/// best-effort and log instead of propagating.
#[derive(Clone)]
pub struct QueueClient {
    conn: ConnectionManager,
    stream_name: String,
}

impl QueueClient {
    /// Connects to Redis and returns the client.
    pub async fn connect(url: &str, stream_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(QueueError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(QueueError::from)?;
        tracing::info!(url, stream = stream_name, "connected to Redis");
        Ok(Self {
            conn,
            stream_name: stream_name.to_string(),
        })
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    // ---- job stream -------------------------------------------------------

    /// Appends a job to the stream, returning the generated `job_id`.
    pub async fn enqueue(&self, draft: JobDraft) -> Result<String, QueueError> {
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            agent_id: draft.agent_id,
            message: draft.message,
            history: draft.history,
            stream: false,
            webhook_output_url: draft.webhook_output_url,
            created_at: chrono::Utc::now(),
        };
        let data = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        let _id: String = conn
            .xadd(
                &self.stream_name,
                "*",
                &[("job_id", job.job_id.as_str()), ("data", data.as_str())],
            )
            .await?;
        tracing::info!(job_id = %job.job_id, agent_id = %job.agent_id, "enqueued job");
        Ok(job.job_id)
    }

    /// Re-appends an existing job, keeping its `job_id` (retry path).
    pub async fn requeue(&self, job: &Job) -> Result<(), QueueError> {
        let data = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let _id: String = conn
            .xadd(
                &self.stream_name,
                "*",
                &[("job_id", job.job_id.as_str()), ("data", data.as_str())],
            )
            .await?;
        Ok(())
    }

    /// Blocking consumer-group read of at most one job.
    ///
    /// The group is created from offset `0` on first use (create-if-missing;
    /// a BUSYGROUP collision from a concurrent consumer is ignored). Returns
    /// `None` when the block interval elapses with nothing to deliver.
    pub async fn read(
        &self,
        group: &str,
        consumer: &str,
        block_ms: usize,
    ) -> Result<Option<DeliveredJob>, QueueError> {
        self.ensure_group(group).await?;

        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(block_ms);
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream_name], &[">"], &options)
            .await?;

        for key in reply.keys {
            for entry in key.ids {
                let raw: Option<String> = entry
                    .map
                    .get("data")
                    .and_then(|v| redis::from_redis_value(v.clone()).ok());
                let Some(raw) = raw else {
                    tracing::warn!(msg_id = %entry.id, "stream entry without data field, acking");
                    self.ack(&entry.id, group).await?;
                    continue;
                };
                match serde_json::from_str::<Job>(&raw) {
                    Ok(job) => {
                        return Ok(Some(DeliveredJob {
                            msg_id: entry.id,
                            job,
                        }))
                    }
                    Err(e) => {
                        tracing::error!(msg_id = %entry.id, error = %e, "undecodable job, acking");
                        self.ack(&entry.id, group).await?;
                    }
                }
            }
        }
        Ok(None)
    }

    async fn ensure_group(&self, group: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream_name, group, "0")
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Acknowledges one stream entry for `group`.
    pub async fn ack(&self, msg_id: &str, group: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(&self.stream_name, group, &[msg_id]).await?;
        Ok(())
    }

    // ---- pub/sub ----------------------------------------------------------

    /// Best-effort pub/sub notification; serialization errors propagate,
    /// delivery does not (fire-and-forget by Redis semantics).
    pub async fn publish<T: serde::Serialize>(
        &self,
        channel: &str,
        payload: &T,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(payload)?;
        let _: i64 = conn.publish(channel, body).await?;
        Ok(())
    }

    // ---- key-value cache --------------------------------------------------

    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(value)?;
        let _: () = conn.set_ex(key, body, ttl_secs).await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    /// Batched MGET; order of values matches `keys`.
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, QueueError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(conn.mget(keys).await?)
    }

    // ---- counters ---------------------------------------------------------

    pub async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, delta).await?)
    }

    pub async fn get_counter(&self, key: &str) -> Result<i64, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    pub async fn expire(&self, key: &str, secs: i64) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: bool = conn.expire(key, secs).await?;
        Ok(())
    }

    // ---- lists ------------------------------------------------------------

    pub async fn lpush(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(key, value).await?;
        Ok(())
    }

    pub async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.ltrim(key, start, stop).await?;
        Ok(())
    }

    pub async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, start, stop).await?)
    }

    // ---- sorted sets (retry schedule) -------------------------------------

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(key, member, score).await?;
        Ok(())
    }

    pub async fn zrangebyscore(
        &self,
        key: &str,
        max: f64,
        limit: isize,
    ) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn
            .zrangebyscore_limit(key, f64::NEG_INFINITY, max, 0, limit)
            .await?)
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(key, member).await?;
        Ok(())
    }

    // ---- sets (index membership) ------------------------------------------

    pub async fn sadd(&self, key: &str, member: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key, member).await?;
        Ok(())
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    pub async fn scard(&self, key: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(key).await?)
    }

    // ---- hashes (cache-backend documents) ---------------------------------

    pub async fn hset_all(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Channel, InboundMessage};

    fn draft() -> JobDraft {
        JobDraft {
            agent_id: "echo".into(),
            message: InboundMessage {
                user_id: "u".into(),
                channel: Channel::Web,
                text: "hello".into(),
                metadata: Default::default(),
                conversation_id: None,
            },
            history: Vec::new(),
            webhook_output_url: None,
        }
    }

    /// **Scenario**: enqueue → read → ack leaves the group with no pending
    /// deliveries; a second read within the block window returns None.
    #[tokio::test]
    #[ignore = "Requires a local Redis; run with: cargo test -p weft queue_round_trip -- --ignored"]
    async fn queue_round_trip() {
        let client = QueueClient::connect("redis://127.0.0.1:6379/0", "weft_test_stream")
            .await
            .unwrap();
        let job_id = client.enqueue(draft()).await.unwrap();

        let delivered = client
            .read(DEFAULT_GROUP, "worker-1", 1000)
            .await
            .unwrap()
            .expect("one delivery");
        assert_eq!(delivered.job.job_id, job_id);
        client.ack(&delivered.msg_id, DEFAULT_GROUP).await.unwrap();

        let empty = client.read(DEFAULT_GROUP, "worker-1", 100).await.unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    #[ignore = "Requires a local Redis"]
    async fn counters_and_lists_round_trip() {
        let client = QueueClient::connect("redis://127.0.0.1:6379/0", "weft_test_stream")
            .await
            .unwrap();
        client.del("weft:test:counter").await.unwrap();
        assert_eq!(client.incr_by("weft:test:counter", 5).await.unwrap(), 5);
        assert_eq!(client.get_counter("weft:test:counter").await.unwrap(), 5);

        client.del("weft:test:list").await.unwrap();
        client.lpush("weft:test:list", "a").await.unwrap();
        client.lpush("weft:test:list", "b").await.unwrap();
        client.ltrim("weft:test:list", 0, 0).await.unwrap();
        assert_eq!(client.lrange("weft:test:list", 0, -1).await.unwrap(), ["b"]);
    }
}
