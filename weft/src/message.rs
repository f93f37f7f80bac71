//! Wire-level message types: normalized inbound messages, queued jobs, and
//! the agent's reply envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rag::RagContext;

/// Channel a message arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Whatsapp,
    Telegram,
    Slack,
    #[default]
    Web,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Telegram => "telegram",
            Channel::Slack => "slack",
            Channel::Web => "web",
        }
    }
}

/// Normalized inbound message, after webhook-body sanitization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub user_id: String,
    #[serde(default)]
    pub channel: Channel,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// One prior conversation turn supplied by the client. Roles other than
/// `user` / `assistant` are dropped during prompt assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Durable queue payload: everything a worker needs to run one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub agent_id: String,
    pub message: InboundMessage,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_output_url: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Final response of one agent turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub agent_id: String,
    pub conversation_id: String,
    pub response: String,
    #[serde(default)]
    pub contexts: Vec<RagContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_defaults_to_web() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"user_id":"u","text":"hi"}"#).unwrap();
        assert_eq!(msg.channel, Channel::Web);
        assert!(msg.metadata.is_empty());
        assert!(msg.conversation_id.is_none());
    }

    #[test]
    fn channel_parses_lowercase_names() {
        for (raw, expected) in [
            ("whatsapp", Channel::Whatsapp),
            ("telegram", Channel::Telegram),
            ("slack", Channel::Slack),
            ("web", Channel::Web),
        ] {
            let c: Channel = serde_json::from_str(&format!("\"{raw}\"")).unwrap();
            assert_eq!(c, expected);
            assert_eq!(c.as_str(), raw);
        }
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = Job {
            job_id: "j1".into(),
            agent_id: "echo".into(),
            message: InboundMessage {
                user_id: "u".into(),
                channel: Channel::Web,
                text: "hi".into(),
                metadata: Default::default(),
                conversation_id: None,
            },
            history: vec![HistoryEntry {
                role: "user".into(),
                content: "earlier".into(),
            }],
            stream: false,
            webhook_output_url: Some("https://out".into()),
            created_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.job_id, "j1");
        assert_eq!(decoded.history.len(), 1);
        assert_eq!(decoded.webhook_output_url.as_deref(), Some("https://out"));
    }
}
