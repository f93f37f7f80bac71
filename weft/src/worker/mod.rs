//! Worker pool: N cooperative consumers sharing one consumer group.
//!
//! Each consumer loops on a 1 s blocking read, processes the job through
//! the agent service, delivers the reply (optional outbound webhook POST,
//! then pub/sub), acks, and emits metrics. Jobs are acked even on failure
//! so one poisoned job cannot block the group; when retry is enabled the
//! failure is recorded to the retry schedule instead.
//!
//! Shutdown: flipping the watch flag lets each consumer finish its current
//! job; the blocking read interval bounds how long shutdown waits.

pub mod retry;

pub use retry::RetryService;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::agent::{AgentRegistry, AgentService};
use crate::message::{AgentReply, Job};
use crate::metrics::MetricsService;
use crate::queue::{QueueClient, DEFAULT_GROUP};

const READ_BLOCK_MS: usize = 1000;
const LOOP_BACKOFF: Duration = Duration::from_millis(100);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_CONSUMERS: usize = 3;

pub struct WorkerPool {
    queue: QueueClient,
    registry: Arc<AgentRegistry>,
    agent_service: Arc<AgentService>,
    metrics: MetricsService,
    retry: Option<RetryService>,
    http: reqwest::Client,
}

impl WorkerPool {
    pub fn new(
        queue: QueueClient,
        registry: Arc<AgentRegistry>,
        agent_service: Arc<AgentService>,
        metrics: MetricsService,
        retry: Option<RetryService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            registry,
            agent_service,
            metrics,
            retry,
            http: reqwest::Client::new(),
        })
    }

    /// Spawns `n` consumers named `worker-1..n`. Returns the join handles;
    /// flip `running` to false to stop them.
    pub fn spawn(self: &Arc<Self>, n: usize, running: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        (1..=n.max(1))
            .map(|i| {
                let pool = Arc::clone(self);
                let running = running.clone();
                let name = format!("worker-{i}");
                tokio::spawn(async move { pool.consume_loop(&name, running).await })
            })
            .collect()
    }

    async fn consume_loop(&self, consumer: &str, running: watch::Receiver<bool>) {
        tracing::info!(consumer, "consumer started");
        while *running.borrow() {
            match self.queue.read(DEFAULT_GROUP, consumer, READ_BLOCK_MS).await {
                Ok(Some(delivered)) => {
                    self.process_job(delivered.msg_id, delivered.job, consumer).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(consumer, error = %e, "queue read failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            tokio::time::sleep(LOOP_BACKOFF).await;
        }
        tracing::info!(consumer, "consumer stopped");
    }

    async fn process_job(&self, msg_id: String, job: Job, consumer: &str) {
        let started = Instant::now();
        tracing::info!(
            job_id = %job.job_id,
            agent_id = %job.agent_id,
            consumer,
            "processing job"
        );

        let Some(agent) = self.registry.get(&job.agent_id) else {
            tracing::error!(job_id = %job.job_id, agent_id = %job.agent_id, "agent not found, dropping job");
            self.ack(&msg_id).await;
            return;
        };

        let reply = self
            .agent_service
            .run_turn(&agent, &job.message, &job.history)
            .await;
        let success = !reply.response.starts_with("Erro ao processar mensagem:");

        if success {
            let webhook_url = job
                .webhook_output_url
                .clone()
                .or_else(|| agent.webhook_output_url.clone());
            if let Some(url) = webhook_url {
                self.post_webhook(&url, &reply).await;
            }

            if let Err(e) = self
                .queue
                .publish(&format!("agent_response:{}", job.agent_id), &reply)
                .await
            {
                tracing::error!(job_id = %job.job_id, error = %e, "pub/sub publish failed");
            }

            if let Some(ref retry) = self.retry {
                let _ = retry.forget(&job.job_id).await;
            }
        } else if let Some(ref retry) = self.retry {
            if let Err(e) = retry.record_failure(&job, &reply.response).await {
                tracing::error!(job_id = %job.job_id, error = %e, "failed to schedule retry");
            }
        }

        // Always ack: failed jobs re-enter through the retry schedule, not
        // through redelivery.
        self.ack(&msg_id).await;

        self.metrics
            .record_message(
                &job.agent_id,
                &job.message.user_id,
                job.message.channel.as_str(),
                started.elapsed().as_secs_f64(),
                reply.tokens_used,
                success,
            )
            .await;
        tracing::info!(job_id = %job.job_id, success, "job processed");
    }

    async fn ack(&self, msg_id: &str) {
        if let Err(e) = self.queue.ack(msg_id, DEFAULT_GROUP).await {
            tracing::error!(msg_id, error = %e, "ack failed");
        }
    }

    /// Outbound webhook POST with a 10 s timeout; failures are logged, not
    /// retried inline.
    async fn post_webhook(&self, url: &str, reply: &AgentReply) {
        let sent = self
            .http
            .post(url)
            .timeout(WEBHOOK_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(reply)
            .send()
            .await;
        match sent {
            Ok(response) => {
                tracing::info!(url, status = %response.status(), "webhook response sent");
            }
            Err(e) => {
                tracing::error!(url, error = %e, "webhook delivery failed");
            }
        }
    }
}
