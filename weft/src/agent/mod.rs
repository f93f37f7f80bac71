//! Agent configuration model, the in-memory registry, and the LLM-driving
//! turn service.
//!
//! An agent is a named per-tenant configuration bundle: prompt, model, tool
//! list, optional RAG binding, optional tabular-data tool, ownership. The
//! persisted YAML dialect uses `nome` / `grupoId` for the display name and
//! owning group; both spellings are accepted on load.

pub mod registry;
pub mod service;

pub use registry::{AgentRegistry, RegistryError};
pub use service::AgentService;

use serde::{Deserialize, Serialize};

/// Backend an agent's RAG binding dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RagBackendKind {
    #[default]
    Qdrant,
    Cache,
}

/// RAG binding: which index to search and how documents were chunked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagBinding {
    #[serde(default, rename = "type")]
    pub backend: RagBackendKind,
    pub index_name: String,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

fn default_top_k() -> u32 {
    5
}
fn default_chunk_size() -> usize {
    1500
}
fn default_overlap() -> usize {
    300
}

/// Tabular-data tool binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DataAnalysisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default = "default_engine", rename = "query_engine")]
    pub engine: String,
}

fn default_engine() -> String {
    "frame".to_string()
}

/// One declared tool. Only `query_data` is executed by the core; other names
/// come back as not-implemented tool results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Full per-agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub id: String,
    /// Display name. Persisted as `nome`.
    #[serde(
        default,
        rename = "nome",
        alias = "name",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    /// Owning tenant group. Persisted as `grupoId`. `None` marks a legacy
    /// file-sourced agent visible to every group.
    #[serde(
        default,
        rename = "grupoId",
        alias = "group_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub group_id: Option<String>,
    pub model: String,
    /// Per-agent LLM credential; encrypted at rest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Name for the `/webhooks/{webhook_name}` route; unique in the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_name: Option<String>,
    pub system_prompt: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub output_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag: Option<RagBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_analysis: Option<DataAnalysisConfig>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_output_url: Option<String>,
}

impl AgentConfig {
    pub fn data_analysis_enabled(&self) -> bool {
        self.data_analysis.as_ref().is_some_and(|d| d.enabled)
    }
}

/// Valid agent ids and webhook names: `[A-Za-z0-9_-]+`.
pub fn is_valid_slug(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_validation_matches_the_charset() {
        assert!(is_valid_slug("agent-1_X"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("has space"));
        assert!(!is_valid_slug("dot.dot"));
        assert!(!is_valid_slug("../escape"));
    }

    #[test]
    fn yaml_dialect_keys_are_accepted() {
        let yaml = r#"
id: geo
nome: Geografia
grupoId: g1
model: gpt-4o-mini
system_prompt: "You answer geography questions."
input_schema: {}
output_schema: {}
rag:
  type: qdrant
  index_name: docs
  top_k: 2
tools: []
"#;
        let agent: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(agent.name.as_deref(), Some("Geografia"));
        assert_eq!(agent.group_id.as_deref(), Some("g1"));
        let rag = agent.rag.unwrap();
        assert_eq!(rag.backend, RagBackendKind::Qdrant);
        assert_eq!(rag.top_k, 2);
        assert_eq!(rag.chunk_size, 1500);
        assert_eq!(rag.overlap, 300);
    }

    #[test]
    fn minimal_json_config_fills_defaults() {
        let agent: AgentConfig = serde_json::from_value(serde_json::json!({
            "id": "echo",
            "model": "gpt-4o-mini",
            "system_prompt": "Repeat the user.",
        }))
        .unwrap();
        assert!(agent.rag.is_none());
        assert!(agent.tools.is_empty());
        assert!(!agent.data_analysis_enabled());
    }

    /// **Scenario**: save → load round-trip keeps every field, including the
    /// persisted-dialect names.
    #[test]
    fn config_round_trips_through_yaml() {
        let agent = AgentConfig {
            id: "analyst".into(),
            name: Some("Analyst".into()),
            group_id: Some("g2".into()),
            model: "gpt-4o".into(),
            api_key: Some("enc:abc".into()),
            webhook_name: Some("analyst-hook".into()),
            system_prompt: "You analyse data.".into(),
            input_schema: serde_json::json!({}),
            output_schema: serde_json::json!({}),
            rag: None,
            data_analysis: Some(DataAnalysisConfig {
                enabled: true,
                files: vec!["scores.csv".into()],
                engine: "frame".into(),
            }),
            tools: vec![ToolConfig {
                name: "lookup".into(),
                kind: "http".into(),
                url: Some("https://example.com".into()),
                description: None,
                parameters: None,
            }],
            webhook_output_url: None,
        };
        let yaml = serde_yaml::to_string(&agent).unwrap();
        assert!(yaml.contains("nome:"));
        assert!(yaml.contains("grupoId:"));
        let back: AgentConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, agent);
    }
}
