//! Typed runtime settings read from the process environment.
//!
//! [`Settings::from_env`] is called once at startup, after the `config` crate
//! has applied `.env` / XDG overlays to the environment. Required fields that
//! are missing or empty refuse startup with [`SettingsError::Missing`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("required setting {0} is missing or empty")]
    Missing(&'static str),
    #[error("setting {name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration for the whole service.
///
/// One immutable value, built at startup and shared by reference through the
/// service container. Sensitive persisted agent fields are encrypted with
/// [`encryption_key`](Settings::encryption_key) (see [`crate::crypto`]).
#[derive(Debug, Clone)]
pub struct Settings {
    /// API key for the OpenAI-compatible LLM endpoint. Required.
    pub openai_api_key: String,
    /// Base URL of the LLM endpoint (chat completions + embeddings).
    pub openai_base_url: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: u32,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    /// Normalized relational-store location; `None` when unset.
    pub database_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub jwt_issuer: String,
    pub jwt_access_ttl_minutes: i64,
    /// Key string for the symmetric encryption of sensitive config fields.
    pub encryption_key: Option<String>,
    pub agents_dir: String,
    pub redis_queue_name: String,
    pub redis_stream_name: String,
    pub migrate_on_startup: bool,
    pub environment: String,
    /// Legacy shared-secret fallback; pre-dates JWT auth.
    pub access_token: Option<String>,
    pub log_level: String,
}

impl Settings {
    /// Reads settings from the environment. Fails when a required field is
    /// missing or empty.
    pub fn from_env() -> Result<Self, SettingsError> {
        let openai_api_key = env_str("OPENAI_API_KEY");
        if openai_api_key.is_empty() {
            return Err(SettingsError::Missing("OPENAI_API_KEY"));
        }

        Ok(Self {
            openai_api_key,
            openai_base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            redis_host: env_or("REDIS_HOST", "localhost"),
            redis_port: env_parse("REDIS_PORT", 6379)?,
            redis_db: env_parse("REDIS_DB", 0)?,
            qdrant_url: env_or("QDRANT_URL", "http://localhost:6333"),
            qdrant_api_key: env_opt("QDRANT_API_KEY"),
            database_url: normalize_database_url(env_opt("DATABASE_URL").as_deref()),
            jwt_secret: env_opt("JWT_SECRET"),
            jwt_issuer: env_or("JWT_ISSUER", "agent-api"),
            jwt_access_ttl_minutes: env_parse("JWT_ACCESS_TTL_MINUTES", 60)?,
            encryption_key: env_opt("ENCRYPTION_KEY"),
            agents_dir: env_or("AGENTS_DIR", "./agents"),
            redis_queue_name: env_or("REDIS_QUEUE_NAME", "agent_jobs"),
            redis_stream_name: env_or("REDIS_STREAM_NAME", "agent_stream"),
            migrate_on_startup: is_truthy(&env_or("MIGRATE_ON_STARTUP", "true")),
            environment: env_or("ENVIRONMENT", "development"),
            access_token: env_opt("ACCESS_TOKEN"),
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }

    /// Connection URL for the Redis client.
    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        )
    }

    /// True in production deployments (controls e.g. Secure cookies).
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn env_str(name: &str) -> String {
    std::env::var(name).unwrap_or_default().trim().to_string()
}

fn env_opt(name: &str) -> Option<String> {
    let v = env_str(name);
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, SettingsError>
where
    T::Err: std::fmt::Display,
{
    match env_opt(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| SettingsError::Invalid {
            name,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

/// Truthy strings for boolean env flags: `1`, `true`, `yes`, `y`.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

/// Normalizes a DATABASE_URL as pasted from provisioning consoles: strips a
/// leading `psql ` and one layer of matching quotes. Empty input → `None`.
pub fn normalize_database_url(raw: Option<&str>) -> Option<String> {
    let mut value = raw?.trim().to_string();
    if value.is_empty() {
        return None;
    }
    if value.to_ascii_lowercase().starts_with("psql ") {
        value = value[5..].trim().to_string();
    }
    let quoted = (value.starts_with('\'') && value.ends_with('\''))
        || (value.starts_with('"') && value.ends_with('"'));
    if quoted && value.len() >= 2 {
        value = value[1..value.len() - 1].to_string();
    }
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_strings_match_the_documented_set() {
        for v in ["1", "true", "yes", "y", "TRUE", " Yes "] {
            assert!(is_truthy(v), "{v:?} should be truthy");
        }
        for v in ["0", "false", "no", "", "on"] {
            assert!(!is_truthy(v), "{v:?} should be falsy");
        }
    }

    #[test]
    fn database_url_strips_psql_prefix_and_quotes() {
        assert_eq!(
            normalize_database_url(Some("psql 'postgres://u:p@h/db'")).as_deref(),
            Some("postgres://u:p@h/db")
        );
        assert_eq!(
            normalize_database_url(Some("\"weft.db\"")).as_deref(),
            Some("weft.db")
        );
        assert_eq!(
            normalize_database_url(Some("PSQL \"x\"")).as_deref(),
            Some("x")
        );
        assert_eq!(normalize_database_url(Some("   ")), None);
        assert_eq!(normalize_database_url(None), None);
    }

    /// **Scenario**: unquoted plain URL passes through untouched.
    #[test]
    fn database_url_plain_value_round_trips() {
        assert_eq!(
            normalize_database_url(Some("sqlite://weft.db")).as_deref(),
            Some("sqlite://weft.db")
        );
    }

    #[test]
    fn from_env_requires_openai_api_key() {
        // Runs in-process: clear the key, expect Missing.
        std::env::remove_var("OPENAI_API_KEY");
        let err = Settings::from_env().unwrap_err();
        assert!(matches!(err, SettingsError::Missing("OPENAI_API_KEY")));

        std::env::set_var("OPENAI_API_KEY", "test-key");
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.openai_api_key, "test-key");
        assert_eq!(settings.redis_port, 6379);
        assert_eq!(settings.jwt_issuer, "agent-api");
        assert_eq!(settings.redis_url(), "redis://localhost:6379/0");
        std::env::remove_var("OPENAI_API_KEY");
    }
}
