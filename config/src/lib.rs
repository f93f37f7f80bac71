//! Environment bootstrap for the weft service.
//!
//! Gathers configuration from a project `.env` file and from
//! `$XDG_CONFIG_HOME/weft/config.toml` (`[env]` table), then applies the
//! merged map to the process environment. Precedence for every key:
//! **existing env > .env > XDG**. `weft::Settings::from_env()` reads the
//! result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

const APP_NAME: &str = "weft";

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Applies `.env` and XDG config values to the process environment, never
/// overwriting keys that are already set. Returns the number of keys set.
///
/// * `override_dir`: directory to look for `.env` in; defaults to the
///   current directory.
pub fn bootstrap_env(override_dir: Option<&Path>) -> Result<usize, BootstrapError> {
    let dotenv = read_dotenv(override_dir)?;
    let xdg = read_xdg_env_table()?;

    let mut applied = 0usize;
    let mut keys: Vec<&String> = dotenv.keys().chain(xdg.keys()).collect();
    keys.sort();
    keys.dedup();
    for key in keys {
        if std::env::var(key).is_ok() {
            continue;
        }
        // .env wins over XDG for keys present in both.
        if let Some(value) = dotenv.get(key).or_else(|| xdg.get(key)) {
            std::env::set_var(key, value);
            applied += 1;
        }
    }
    Ok(applied)
}

fn read_dotenv(override_dir: Option<&Path>) -> Result<HashMap<String, String>, BootstrapError> {
    let dir = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(_) => return Ok(HashMap::new()),
        },
    };
    let path = dir.join(".env");
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(&path).map_err(|source| BootstrapError::Read {
        path: path.clone(),
        source,
    })?;
    Ok(parse_env_lines(&content))
}

/// KEY=VALUE lines; `#` comment lines and blanks skipped; one layer of
/// matching quotes stripped from the value.
fn parse_env_lines(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    out
}

fn unquote(value: &str) -> &str {
    let quoted = (value.starts_with('"') && value.ends_with('"'))
        || (value.starts_with('\'') && value.ends_with('\''));
    if quoted && value.len() >= 2 {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn xdg_config_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::config_dir()?,
    };
    Some(base.join(APP_NAME).join("config.toml"))
}

/// Reads the `[env]` table of `~/.config/weft/config.toml`; a missing file
/// is an empty map, a malformed one is an error.
fn read_xdg_env_table() -> Result<HashMap<String, String>, BootstrapError> {
    let Some(path) = xdg_config_path() else {
        return Ok(HashMap::new());
    };
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(&path).map_err(|source| BootstrapError::Read {
        path: path.clone(),
        source,
    })?;
    let document: toml::Value =
        toml::from_str(&content).map_err(|source| BootstrapError::ParseToml { path, source })?;

    let mut out = HashMap::new();
    if let Some(table) = document.get("env").and_then(|v| v.as_table()) {
        for (key, value) in table {
            let rendered = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.insert(key.clone(), rendered);
        }
    }
    Ok(out)
}
