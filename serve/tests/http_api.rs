//! End-to-end API scenarios over a real listener.
//!
//! These tests bind `127.0.0.1:0`, assemble a container around a scripted
//! LLM, and drive the HTTP surface with reqwest. They need a local Redis
//! for the queue/cache primitives, so they are ignored by default:
//!
//! ```text
//! cargo test -p serve -- --ignored
//! ```

use std::sync::Arc;

use serve::Container;
use weft::agent::{AgentConfig, AgentRegistry, AgentService, DataAnalysisConfig};
use weft::auth::AuthStore;
use weft::llm::{LlmClient, ScriptedLlm};
use weft::metrics::MetricsService;
use weft::queue::QueueClient;
use weft::rag::{RagDocumentService, RagService};
use weft::settings::Settings;
use weft::tabular::DataService;
use weft::vector::{CacheVectorStore, VectorStore};

const REDIS_URL: &str = "redis://127.0.0.1:6379/0";

fn test_settings(jwt_secret: Option<&str>) -> Settings {
    Settings {
        openai_api_key: "test-key".into(),
        openai_base_url: "http://127.0.0.1:1/v1".into(),
        redis_host: "127.0.0.1".into(),
        redis_port: 6379,
        redis_db: 0,
        qdrant_url: "http://127.0.0.1:6334".into(),
        qdrant_api_key: None,
        database_url: None,
        jwt_secret: jwt_secret.map(String::from),
        jwt_issuer: "agent-api".into(),
        jwt_access_ttl_minutes: 60,
        encryption_key: None,
        agents_dir: "./agents".into(),
        redis_queue_name: "agent_jobs".into(),
        redis_stream_name: "weft_serve_test_stream".into(),
        migrate_on_startup: true,
        environment: "development".into(),
        access_token: None,
        log_level: "info".into(),
    }
}

fn echo_agent(id: &str, group_id: Option<&str>) -> AgentConfig {
    AgentConfig {
        id: id.into(),
        name: None,
        group_id: group_id.map(String::from),
        model: "gpt-4o-mini".into(),
        api_key: None,
        webhook_name: None,
        system_prompt: "Repeat the user.".into(),
        input_schema: serde_json::json!({}),
        output_schema: serde_json::json!({}),
        rag: None,
        data_analysis: None,
        tools: Vec::new(),
        webhook_output_url: None,
    }
}

/// Builds a container around `llm` without touching Qdrant or OpenAI.
async fn test_container(
    llm: Arc<dyn LlmClient>,
    dirs: &(tempfile::TempDir, tempfile::TempDir, tempfile::TempDir),
    jwt_secret: Option<&str>,
) -> Arc<Container> {
    let settings = test_settings(jwt_secret);
    let queue = QueueClient::connect(REDIS_URL, &settings.redis_stream_name)
        .await
        .expect("local Redis required");
    let cache_store: Arc<dyn VectorStore> = Arc::new(CacheVectorStore::new(queue.clone()));
    let auth_store = AuthStore::open(dirs.2.path().join("weft.db")).unwrap();
    let registry = Arc::new(AgentRegistry::new(dirs.0.path(), None, None));
    let rag = Arc::new(RagService::new(llm.clone(), None, cache_store.clone()));
    let rag_documents = Arc::new(RagDocumentService::new(
        llm.clone(),
        None,
        cache_store,
        "embed-model",
    ));
    let data = Arc::new(DataService::new(dirs.1.path()));
    let agent_service = Arc::new(AgentService::new(llm, rag, Some(data.clone())));
    let metrics = MetricsService::new(queue.clone());

    Arc::new(Container {
        settings,
        queue,
        registry,
        agent_service,
        rag_documents,
        data,
        metrics,
        auth_store,
        retry: None,
    })
}

async fn spawn_server(container: Arc<Container>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = serve::run_serve_on_listener(listener, container, std::future::pending()).await;
    });
    format!("http://{addr}")
}

fn dirs() -> (tempfile::TempDir, tempfile::TempDir, tempfile::TempDir) {
    (
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    )
}

/// **Scenario**: SSE echo with no RAG — the streamed frames concatenate to
/// the scripted reply, one JSON-encoded string per frame.
#[tokio::test]
#[ignore = "Requires a local Redis"]
async fn sse_stream_concatenates_to_the_reply() {
    let dirs = dirs();
    let llm = Arc::new(ScriptedLlm::replies(["Hello"]));
    let container = test_container(llm, &dirs, None).await;
    container.registry.save(echo_agent("echo", None)).unwrap();
    let base = spawn_server(container).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webhooks/agent/echo"))
        .json(&serde_json::json!({"text": "Hello", "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = response.text().await.unwrap();
    let mut assembled = String::new();
    for line in body.lines() {
        if let Some(payload) = line.strip_prefix("data: ") {
            if let Ok(chunk) = serde_json::from_str::<String>(payload) {
                assembled.push_str(&chunk);
            }
        }
    }
    assert_eq!(assembled, "Hello");
}

/// **Scenario**: queued delivery — `stream: false` answers with an
/// enqueued job id.
#[tokio::test]
#[ignore = "Requires a local Redis"]
async fn non_streaming_webhook_enqueues_a_job() {
    let dirs = dirs();
    let llm = Arc::new(ScriptedLlm::replies(["Hello"]));
    let container = test_container(llm, &dirs, None).await;
    container.registry.save(echo_agent("echo", None)).unwrap();
    let base = spawn_server(container).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webhooks/agent/echo"))
        .json(&serde_json::json!({"text": "Hello", "stream": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "enqueued");
    assert_eq!(body["agent_id"], "echo");
    assert!(!body["job_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
#[ignore = "Requires a local Redis"]
async fn unknown_agent_and_webhook_name_return_404() {
    let dirs = dirs();
    let llm = Arc::new(ScriptedLlm::default());
    let container = test_container(llm, &dirs, None).await;
    let base = spawn_server(container).await;

    let client = reqwest::Client::new();
    let by_id = client
        .post(format!("{base}/webhooks/agent/ghost"))
        .json(&serde_json::json!({"text": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(by_id.status(), 404);

    let by_name = client
        .post(format!("{base}/webhooks/ghost-hook"))
        .json(&serde_json::json!({"text": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(by_name.status(), 404);
}

/// **Scenario**: auth rejection — no token → 401; expired token → 401;
/// a valid group token only sees its own (or groupless) agents.
#[tokio::test]
#[ignore = "Requires a local Redis"]
async fn agents_listing_enforces_auth_and_group_visibility() {
    let dirs = dirs();
    let llm = Arc::new(ScriptedLlm::default());
    let container = test_container(llm, &dirs, Some("test-secret")).await;

    let admin = container
        .auth_store
        .setup_initial("admin@example.com", "pw", "g1")
        .unwrap();
    let g1 = admin.group_id.clone().unwrap();

    container.registry.save(echo_agent("mine", Some(&g1))).unwrap();
    container
        .registry
        .save(echo_agent("theirs", Some("other-group")))
        .unwrap();
    container.registry.save(echo_agent("legacy", None)).unwrap();

    let base = spawn_server(container.clone()).await;
    let client = reqwest::Client::new();

    let anonymous = client.get(format!("{base}/agents")).send().await.unwrap();
    assert_eq!(anonymous.status(), 401);

    let expired = weft::auth::token::issue(
        "test-secret",
        "agent-api",
        &admin.id,
        Some(&g1),
        weft::auth::UserLevel::Admin,
        -5,
    )
    .unwrap();
    let rejected = client
        .get(format!("{base}/agents"))
        .bearer_auth(&expired.token)
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 401);

    // A group admin (not ADMIN_GERAL) sees g1 and legacy agents only.
    let issued = weft::auth::token::issue(
        "test-secret",
        "agent-api",
        &admin.id,
        Some(&g1),
        weft::auth::UserLevel::Admin,
        60,
    )
    .unwrap();
    container
        .auth_store
        .insert_token(&issued.jti, &admin.id, issued.expires_at)
        .unwrap();

    let listing: serde_json::Value = client
        .get(format!("{base}/agents"))
        .bearer_auth(&issued.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = listing["agents"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["legacy", "mine"]);
}

/// **Scenario**: sandbox rejection — a hostile query string is refused with
/// the forbidden-operations error and nothing is evaluated.
#[tokio::test]
#[ignore = "Requires a local Redis"]
async fn data_query_rejects_forbidden_expressions() {
    let dirs = dirs();
    let llm = Arc::new(ScriptedLlm::default());
    let container = test_container(llm, &dirs, None).await;

    let mut analyst = echo_agent("analyst", None);
    analyst.data_analysis = Some(DataAnalysisConfig {
        enabled: true,
        files: vec!["scores.csv".into()],
        engine: "frame".into(),
    });
    container.registry.save(analyst).unwrap();
    container
        .data
        .save_file("analyst", "scores.csv", b"name,score\nana,42\n")
        .unwrap();

    let base = spawn_server(container).await;
    let response: serde_json::Value = reqwest::Client::new()
        .post(format!("{base}/agents/analyst/data/query"))
        .json(&serde_json::json!({
            "query": "__import__('os').system('rm -rf /')",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(response["result"]["success"], false);
    assert_eq!(
        response["result"]["error"],
        "Query contains forbidden operations"
    );

    // A legitimate query on the same agent works.
    let ok: serde_json::Value = reqwest::Client::new()
        .post(format!("{base}/agents/analyst/data/query"))
        .json(&serde_json::json!({"query": "df.head()"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok["result"]["success"], true);
    assert_eq!(ok["result"]["rows"], 1);
}

#[tokio::test]
#[ignore = "Requires a local Redis"]
async fn health_reports_redis_and_agent_count() {
    let dirs = dirs();
    let llm = Arc::new(ScriptedLlm::default());
    let container = test_container(llm, &dirs, None).await;
    container.registry.save(echo_agent("echo", None)).unwrap();
    let base = spawn_server(container).await;

    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["redis"], "connected");
    assert_eq!(body["agents_loaded"], 1);
}
