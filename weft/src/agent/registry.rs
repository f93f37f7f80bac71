//! Agent registry: unified file + database source, indexed by id and by
//! webhook name, hot-reloadable.
//!
//! `load_all` reads the agents directory first (YAML and JSON both
//! recognized), then the DB table, decrypting `enc:`-tagged values
//! recursively. The registry is read-mostly: mutations take the writer lock
//! over both maps and update them atomically; reads clone a snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;

use super::{is_valid_slug, AgentConfig};
use crate::auth::store::{AgentRow, AuthStore};
use crate::crypto;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid agent id {0:?} (expected [A-Za-z0-9_-]+)")]
    InvalidId(String),
    #[error("invalid webhook name {0:?} (expected [A-Za-z0-9_-]+)")]
    InvalidWebhookName(String),
    #[error("webhook name {0:?} is already taken by agent {1:?}")]
    DuplicateWebhookName(String, String),
    #[error("agent {0:?} not found")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent file parse error: {0}")]
    Parse(String),
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<String, AgentConfig>,
    webhook_to_id: HashMap<String, String>,
}

pub struct AgentRegistry {
    agents_dir: PathBuf,
    store: Option<AuthStore>,
    encryption_key: Option<String>,
    inner: RwLock<Indexes>,
}

impl AgentRegistry {
    pub fn new(
        agents_dir: impl AsRef<Path>,
        store: Option<AuthStore>,
        encryption_key: Option<String>,
    ) -> Self {
        Self {
            agents_dir: agents_dir.as_ref().to_path_buf(),
            store,
            encryption_key,
            inner: RwLock::new(Indexes::default()),
        }
    }

    /// Clears and rebuilds both indexes from files and the DB table.
    pub fn load_all(&self) -> Result<usize, RegistryError> {
        if !self.agents_dir.exists() {
            tracing::warn!(dir = %self.agents_dir.display(), "agents directory missing, creating");
            std::fs::create_dir_all(&self.agents_dir)?;
        }

        let mut fresh = Indexes::default();
        self.load_from_files(&mut fresh);
        self.load_from_db(&mut fresh);

        let count = fresh.by_id.len();
        *self.inner.write().expect("registry lock poisoned") = fresh;
        tracing::info!(count, "agents loaded");
        Ok(count)
    }

    fn load_from_files(&self, indexes: &mut Indexes) {
        let entries = match std::fs::read_dir(&self.agents_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "cannot read agents directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();
            if !matches!(ext, "yaml" | "yml" | "json") {
                continue;
            }
            match Self::read_agent_file(&path) {
                Ok(agent) => {
                    tracing::info!(agent_id = %agent.id, path = %path.display(), "loaded file agent");
                    Self::index(indexes, agent);
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "skipping agent file");
                }
            }
        }
    }

    fn read_agent_file(path: &Path) -> Result<AgentConfig, RegistryError> {
        let raw = std::fs::read_to_string(path)?;
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        if is_json {
            serde_json::from_str(&raw).map_err(|e| RegistryError::Parse(e.to_string()))
        } else {
            serde_yaml::from_str(&raw).map_err(|e| RegistryError::Parse(e.to_string()))
        }
    }

    fn load_from_db(&self, indexes: &mut Indexes) {
        let Some(ref store) = self.store else { return };
        let rows = match store.list_agent_rows() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "failed to fetch agents from DB");
                return;
            }
        };
        for row in rows {
            match self.row_to_agent(row) {
                Ok(agent) => {
                    tracing::info!(agent_id = %agent.id, "loaded DB agent");
                    Self::index(indexes, agent);
                }
                Err(e) => tracing::error!(error = %e, "skipping DB agent row"),
            }
        }
    }

    fn row_to_agent(&self, row: AgentRow) -> Result<AgentConfig, RegistryError> {
        let mut config = match self.encryption_key {
            Some(ref key) => crypto::decrypt_json(row.config, key),
            None => row.config,
        };
        // The row columns are authoritative over whatever the JSON says.
        if let Some(map) = config.as_object_mut() {
            map.insert("id".into(), serde_json::Value::String(row.id));
            if let Some(name) = row.name {
                map.insert("nome".into(), serde_json::Value::String(name));
            }
            if let Some(group) = row.group_id {
                map.insert("grupoId".into(), serde_json::Value::String(group));
            }
        }
        serde_json::from_value(config).map_err(|e| RegistryError::Parse(e.to_string()))
    }

    fn index(indexes: &mut Indexes, agent: AgentConfig) {
        if let Some(ref webhook_name) = agent.webhook_name {
            indexes
                .webhook_to_id
                .insert(webhook_name.clone(), agent.id.clone());
        }
        indexes.by_id.insert(agent.id.clone(), agent);
    }

    pub fn get(&self, id: &str) -> Option<AgentConfig> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    pub fn get_by_webhook_name(&self, webhook_name: &str) -> Option<AgentConfig> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .webhook_to_id
            .get(webhook_name)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Cloned snapshot of every agent, keyed by id.
    pub fn list(&self) -> HashMap<String, AgentConfig> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_id
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validates, persists to `<agents_dir>/<id>.yaml`, and updates both
    /// indexes under one writer lock.
    pub fn save(&self, agent: AgentConfig) -> Result<(), RegistryError> {
        if !is_valid_slug(&agent.id) {
            return Err(RegistryError::InvalidId(agent.id));
        }
        if let Some(ref webhook_name) = agent.webhook_name {
            if !is_valid_slug(webhook_name) {
                return Err(RegistryError::InvalidWebhookName(webhook_name.clone()));
            }
        }

        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(ref webhook_name) = agent.webhook_name {
            if let Some(owner) = inner.webhook_to_id.get(webhook_name) {
                if owner != &agent.id {
                    return Err(RegistryError::DuplicateWebhookName(
                        webhook_name.clone(),
                        owner.clone(),
                    ));
                }
            }
        }

        let yaml = serde_yaml::to_string(&agent)
            .map_err(|e| RegistryError::Parse(e.to_string()))?;
        std::fs::create_dir_all(&self.agents_dir)?;
        std::fs::write(self.agents_dir.join(format!("{}.yaml", agent.id)), yaml)?;

        // Drop a stale webhook-name entry when the agent was renamed.
        if let Some(previous) = inner.by_id.get(&agent.id) {
            if previous.webhook_name != agent.webhook_name {
                if let Some(old_name) = previous.webhook_name.clone() {
                    inner.webhook_to_id.remove(&old_name);
                }
            }
        }
        if let Some(ref webhook_name) = agent.webhook_name {
            inner
                .webhook_to_id
                .insert(webhook_name.clone(), agent.id.clone());
        }
        inner.by_id.insert(agent.id.clone(), agent);
        Ok(())
    }

    /// Removes the agent file, its DB row when present, and both map entries.
    pub fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let agent = inner
            .by_id
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if let Some(ref webhook_name) = agent.webhook_name {
            inner.webhook_to_id.remove(webhook_name);
        }
        drop(inner);

        let file = self.agents_dir.join(format!("{id}.yaml"));
        if file.exists() {
            std::fs::remove_file(file)?;
        }
        if let Some(ref store) = self.store {
            if let Err(e) = store.delete_agent_row(id) {
                tracing::error!(agent_id = id, error = %e, "failed to delete DB agent row");
            }
        }
        Ok(())
    }

    /// Reloads everything. Per-id granularity is intentionally not attempted:
    /// file/DB reconciliation per id is not worth the complexity.
    pub fn reload_one(&self, id: &str) -> Result<bool, RegistryError> {
        self.load_all()?;
        Ok(self.get(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{DataAnalysisConfig, RagBackendKind, RagBinding};

    fn agent(id: &str, webhook_name: Option<&str>) -> AgentConfig {
        AgentConfig {
            id: id.into(),
            name: None,
            group_id: None,
            model: "gpt-4o-mini".into(),
            api_key: None,
            webhook_name: webhook_name.map(String::from),
            system_prompt: "prompt".into(),
            input_schema: serde_json::json!({}),
            output_schema: serde_json::json!({}),
            rag: None,
            data_analysis: None,
            tools: Vec::new(),
            webhook_output_url: None,
        }
    }

    fn registry(dir: &Path) -> AgentRegistry {
        AgentRegistry::new(dir, None, None)
    }

    #[test]
    fn save_indexes_by_id_and_webhook_name() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.save(agent("echo", Some("echo-hook"))).unwrap();

        assert!(reg.get("echo").is_some());
        assert_eq!(reg.get_by_webhook_name("echo-hook").unwrap().id, "echo");
        assert!(dir.path().join("echo.yaml").exists());
    }

    #[test]
    fn save_rejects_bad_slugs() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert!(matches!(
            reg.save(agent("../evil", None)),
            Err(RegistryError::InvalidId(_))
        ));
        assert!(matches!(
            reg.save(agent("ok", Some("bad name"))),
            Err(RegistryError::InvalidWebhookName(_))
        ));
    }

    #[test]
    fn duplicate_webhook_name_with_different_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.save(agent("a", Some("shared"))).unwrap();
        let err = reg.save(agent("b", Some("shared"))).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateWebhookName(_, _)));
        // Re-saving the owner under the same name is fine.
        reg.save(agent("a", Some("shared"))).unwrap();
    }

    #[test]
    fn renaming_webhook_drops_the_old_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.save(agent("a", Some("old"))).unwrap();
        reg.save(agent("a", Some("new"))).unwrap();
        assert!(reg.get_by_webhook_name("old").is_none());
        assert_eq!(reg.get_by_webhook_name("new").unwrap().id, "a");
    }

    #[test]
    fn load_all_reads_yaml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("y.yaml"),
            "id: y\nmodel: m\nsystem_prompt: p\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("j.json"),
            r#"{"id": "j", "model": "m", "system_prompt": "p", "webhook_name": "jhook"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let reg = registry(dir.path());
        assert_eq!(reg.load_all().unwrap(), 2);
        assert!(reg.get("y").is_some());
        assert_eq!(reg.get_by_webhook_name("jhook").unwrap().id, "j");
    }

    /// **Scenario**: register → delete → register leaves an agent
    /// indistinguishable from the original.
    #[test]
    fn register_delete_register_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let original = AgentConfig {
            rag: Some(RagBinding {
                backend: RagBackendKind::Cache,
                index_name: "docs".into(),
                top_k: 3,
                chunk_size: 1500,
                overlap: 300,
            }),
            data_analysis: Some(DataAnalysisConfig {
                enabled: true,
                files: vec!["f.csv".into()],
                engine: "frame".into(),
            }),
            ..agent("full", Some("full-hook"))
        };

        reg.save(original.clone()).unwrap();
        reg.delete("full").unwrap();
        assert!(reg.get("full").is_none());
        assert!(reg.get_by_webhook_name("full-hook").is_none());
        assert!(!dir.path().join("full.yaml").exists());

        reg.save(original.clone()).unwrap();
        assert_eq!(reg.get("full").unwrap(), original);
    }

    /// **Scenario**: reload from an unchanged backing store is observationally
    /// a no-op.
    #[test]
    fn reload_from_unchanged_store_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.save(agent("a", Some("ah"))).unwrap();
        reg.save(agent("b", None)).unwrap();

        reg.load_all().unwrap();
        let first = reg.list();
        reg.load_all().unwrap();
        assert_eq!(reg.list(), first);
        assert!(reg.reload_one("a").unwrap());
        assert!(!reg.reload_one("missing").unwrap());
    }

    /// **Scenario**: two concurrent saves of different agents both succeed
    /// and both are visible in the next read.
    #[test]
    fn concurrent_saves_of_different_agents_both_land() {
        let dir = tempfile::tempdir().unwrap();
        let reg = std::sync::Arc::new(registry(dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = std::sync::Arc::clone(&reg);
                std::thread::spawn(move || {
                    reg.save(agent(&format!("agent-{i}"), Some(&format!("hook-{i}"))))
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(reg.list().len(), 8);
        for i in 0..8 {
            assert_eq!(
                reg.get_by_webhook_name(&format!("hook-{i}")).unwrap().id,
                format!("agent-{i}")
            );
        }
    }

    /// **Scenario**: concurrent saves racing for the same webhook name with
    /// different ids never both succeed.
    #[test]
    fn concurrent_same_webhook_name_never_both_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let reg = std::sync::Arc::new(registry(dir.path()));

        let results: Vec<_> = (0..4)
            .map(|i| {
                let reg = std::sync::Arc::clone(&reg);
                std::thread::spawn(move || reg.save(agent(&format!("racer-{i}"), Some("the-hook"))))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(reg.get_by_webhook_name("the-hook").is_some());
    }

    #[test]
    fn db_rows_are_decrypted_and_column_forced() {
        let dir = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let store = AuthStore::open(db.path().join("a.db")).unwrap();
        let key = "reg-test-key";

        let sealed = crypto::encrypt("sk-agent-key", key).unwrap();
        store
            .upsert_agent_row(&AgentRow {
                id: "db-bot".into(),
                name: Some("DB Bot".into()),
                group_id: Some("g9".into()),
                config: serde_json::json!({
                    "id": "stale-id",
                    "model": "m",
                    "system_prompt": "p",
                    "api_key": sealed,
                }),
            })
            .unwrap();

        let reg = AgentRegistry::new(dir.path(), Some(store), Some(key.to_string()));
        reg.load_all().unwrap();

        let loaded = reg.get("db-bot").expect("row id wins over config id");
        assert_eq!(loaded.api_key.as_deref(), Some("sk-agent-key"));
        assert_eq!(loaded.name.as_deref(), Some("DB Bot"));
        assert_eq!(loaded.group_id.as_deref(), Some("g9"));
    }
}
