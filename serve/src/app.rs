//! Service container and router assembly.
//!
//! All shared infrastructure is built once at startup into one immutable
//! [`Container`] passed by `Arc` to every handler — no ambient globals.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use weft::agent::{AgentRegistry, AgentService};
use weft::auth::AuthStore;
use weft::llm::{LlmClient, OpenAiClient};
use weft::metrics::MetricsService;
use weft::queue::QueueClient;
use weft::rag::{RagDocumentService, RagService, DEFAULT_EMBEDDING_MODEL};
use weft::settings::Settings;
use weft::tabular::DataService;
use weft::vector::{CacheVectorStore, QdrantStore, VectorStore};
use weft::worker::RetryService;

use crate::middleware::auth_middleware;
use crate::routes;

pub struct Container {
    pub settings: Settings,
    pub queue: QueueClient,
    pub registry: Arc<AgentRegistry>,
    pub agent_service: Arc<AgentService>,
    pub rag_documents: Arc<RagDocumentService>,
    pub data: Arc<DataService>,
    pub metrics: MetricsService,
    pub auth_store: AuthStore,
    pub retry: Option<RetryService>,
}

impl Container {
    /// Connects the infrastructure clients and wires the services.
    ///
    /// Qdrant is optional at runtime: when the warm-up loop gives up the
    /// service still starts with the cache backend only, and agents bound
    /// to the Qdrant backend retrieve nothing until it comes back.
    pub async fn build(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let queue = QueueClient::connect(&settings.redis_url(), &settings.redis_stream_name).await?;

        let qdrant: Option<Arc<dyn VectorStore>> =
            match QdrantStore::connect(&settings.qdrant_url, settings.qdrant_api_key.clone()).await
            {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    tracing::error!(error = %e, "Qdrant unavailable, continuing with cache backend only");
                    None
                }
            };
        let cache_store: Arc<dyn VectorStore> = Arc::new(CacheVectorStore::new(queue.clone()));

        let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
            &settings.openai_api_key,
            &settings.openai_base_url,
        ));

        let db_path = settings
            .database_url
            .clone()
            .unwrap_or_else(|| "weft.db".to_string());
        let auth_store = AuthStore::open(&db_path)?;
        if settings.migrate_on_startup {
            auth_store.migrate()?;
        }

        let registry = Arc::new(AgentRegistry::new(
            &settings.agents_dir,
            Some(auth_store.clone()),
            settings.encryption_key.clone(),
        ));

        let rag = Arc::new(RagService::new(
            llm.clone(),
            qdrant.clone(),
            cache_store.clone(),
        ));
        let rag_documents = Arc::new(RagDocumentService::new(
            llm.clone(),
            qdrant,
            cache_store,
            DEFAULT_EMBEDDING_MODEL,
        ));
        let data = Arc::new(DataService::new("./data"));
        let agent_service = Arc::new(AgentService::new(llm, rag, Some(data.clone())));
        let metrics = MetricsService::new(queue.clone());
        let retry = Some(RetryService::new(queue.clone()));

        Ok(Arc::new(Self {
            settings,
            queue,
            registry,
            agent_service,
            rag_documents,
            data,
            metrics,
            auth_store,
            retry,
        }))
    }

    /// Loads agents and warms the per-agent frame caches.
    pub fn load_agents(&self) -> anyhow::Result<usize> {
        let count = self.registry.load_all()?;
        for (agent_id, agent) in self.registry.list() {
            if let Some(ref binding) = agent.data_analysis {
                if binding.enabled && !binding.files.is_empty() {
                    self.data.load_agent_files(&agent_id, &binding.files);
                }
            }
        }
        Ok(count)
    }
}

pub fn router(container: Arc<Container>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(routes::webhooks::router())
        .merge(routes::auth::router())
        .merge(routes::agents::router())
        .merge(routes::rag::router())
        .merge(routes::metrics::router())
        .layer(axum::middleware::from_fn_with_state(
            container.clone(),
            auth_middleware,
        ))
        .with_state(container)
}

async fn health(State(container): State<Arc<Container>>) -> Json<serde_json::Value> {
    let redis_ok = container.queue.ping().await;
    Json(serde_json::json!({
        "status": if redis_ok { "healthy" } else { "degraded" },
        "redis": if redis_ok { "connected" } else { "disconnected" },
        "agents_loaded": container.registry.len(),
    }))
}
