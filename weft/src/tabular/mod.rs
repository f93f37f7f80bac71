//! Sandboxed tabular-query tool: per-agent files loaded into in-memory
//! frames, queried through a restricted expression language.
//!
//! Security gates run before anything is parsed: a case-insensitive
//! forbidden-substring check, then a closed allow-list of dataframe
//! operations. Evaluation is the hand-written interpreter in [`query`] —
//! never host-language eval.

pub mod frame;
pub mod query;

pub use frame::{Cell, Frame, Series};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TabularError {
    #[error("unknown column {0:?}")]
    UnknownColumn(String),
    #[error("method '{0}' is not allowed")]
    MethodNotAllowed(String),
    #[error("{0}")]
    Parse(String),
    #[error("failed to load file: {0}")]
    Load(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Substrings that reject a query outright (checked case-insensitively,
/// before any parsing).
const FORBIDDEN: &[&str] = &[
    "import",
    "exec",
    "eval",
    "__",
    "open(",
    "globals",
    "locals",
    "subprocess",
    "os",
    "system",
    "file",
];

/// The closed allow-list of dataframe operations.
const ALLOWED_METHODS: &[&str] = &[
    "head",
    "tail",
    "describe",
    "info",
    "columns",
    "shape",
    "dtypes",
    "isna",
    "notna",
    "sum",
    "mean",
    "median",
    "max",
    "min",
    "std",
    "count",
    "value_counts",
    "groupby",
    "sort_values",
    "dropna",
    "fillna",
    "query",
    "loc",
    "iloc",
    "select_dtypes",
    "nunique",
    "unique",
    "sample",
];

const ALLOWED_EXTENSIONS: &[&str] = &["csv", "json", "xlsx", "xls"];

/// Result envelope of one query, serialized into the tool-result message.
#[derive(Debug, Clone, Serialize, Default)]
pub struct QueryOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl QueryOutcome {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Metadata for one stored agent file.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub filename: String,
    pub size: u64,
    pub extension: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
}

/// Per-agent frame cache over files confined to
/// `<data_dir>/agents/<agent_id>/files/`.
///
/// Frames are immutable after load (queries clone or borrow a read view),
/// so concurrent queries on one agent need no further locking.
pub struct DataService {
    data_dir: PathBuf,
    frames: RwLock<HashMap<String, HashMap<String, Arc<Frame>>>>,
}

impl DataService {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            frames: RwLock::new(HashMap::new()),
        }
    }

    fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.data_dir.join("agents").join(agent_id).join("files")
    }

    /// Strips any path components; uploads land flat in the agent dir.
    fn basename(name: &str) -> String {
        Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn extension_allowed(name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| ALLOWED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    fn load_frame(path: &Path) -> Result<Frame, TabularError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Frame::from_csv_reader(std::fs::File::open(path)?),
            "json" => Frame::from_json_bytes(&std::fs::read(path)?),
            "xlsx" | "xls" => Frame::from_xlsx_path(path),
            other => Err(TabularError::Load(format!("unsupported file type .{other}"))),
        }
    }

    /// Saves a file for an agent and loads it into the frame cache.
    pub fn save_file(
        &self,
        agent_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<FileInfo, TabularError> {
        let name = Self::basename(name);
        if !Self::extension_allowed(&name) {
            return Err(TabularError::Load(format!(
                "file type not allowed: {name:?} (expected csv, json, xlsx, xls)"
            )));
        }
        let dir = self.agent_dir(agent_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(&name);
        std::fs::write(&path, bytes)?;

        let frame = Self::load_frame(&path)?;
        let info = FileInfo {
            filename: name.clone(),
            size: bytes.len() as u64,
            extension: path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default(),
            rows: Some(frame.n_rows()),
            columns: Some(frame.columns.clone()),
        };
        self.frames
            .write()
            .expect("frame cache lock poisoned")
            .entry(agent_id.to_string())
            .or_default()
            .insert(name.clone(), Arc::new(frame));
        tracing::info!(agent_id, file = %name, "saved and loaded data file");
        Ok(info)
    }

    /// Loads the named files from the agent's directory into the cache.
    /// Missing files are logged and skipped.
    pub fn load_agent_files(&self, agent_id: &str, filenames: &[String]) {
        let dir = self.agent_dir(agent_id);
        for filename in filenames {
            let name = Self::basename(filename);
            let path = dir.join(&name);
            if !path.exists() {
                tracing::warn!(agent_id, file = %name, "data file not found");
                continue;
            }
            match Self::load_frame(&path) {
                Ok(frame) => {
                    self.frames
                        .write()
                        .expect("frame cache lock poisoned")
                        .entry(agent_id.to_string())
                        .or_default()
                        .insert(name.clone(), Arc::new(frame));
                    tracing::info!(agent_id, file = %name, "loaded data file");
                }
                Err(e) => {
                    tracing::error!(agent_id, file = %name, error = %e, "failed to load data file");
                }
            }
        }
    }

    pub fn list_files(&self, agent_id: &str) -> Vec<FileInfo> {
        let dir = self.agent_dir(agent_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let frames = self.frames.read().expect("frame cache lock poisoned");
        let loaded = frames.get(agent_id);
        let mut files: Vec<FileInfo> = entries
            .flatten()
            .filter(|entry| entry.path().is_file())
            .map(|entry| {
                let filename = entry.file_name().to_string_lossy().into_owned();
                let frame = loaded.and_then(|m| m.get(&filename));
                FileInfo {
                    size: entry.metadata().map(|m| m.len()).unwrap_or(0),
                    extension: entry
                        .path()
                        .extension()
                        .map(|e| format!(".{}", e.to_string_lossy()))
                        .unwrap_or_default(),
                    rows: frame.map(|f| f.n_rows()),
                    columns: frame.map(|f| f.columns.clone()),
                    filename,
                }
            })
            .collect();
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        files
    }

    pub fn delete_file(&self, agent_id: &str, name: &str) -> Result<bool, TabularError> {
        let name = Self::basename(name);
        let path = self.agent_dir(agent_id).join(&name);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        if let Some(agent_frames) = self
            .frames
            .write()
            .expect("frame cache lock poisoned")
            .get_mut(agent_id)
        {
            agent_frames.remove(&name);
        }
        Ok(true)
    }

    /// Layout of every loaded frame, embedded in the `query_data` tool
    /// description so the model knows what it can ask for.
    pub fn frame_summaries(&self, agent_id: &str) -> serde_json::Value {
        let frames = self.frames.read().expect("frame cache lock poisoned");
        let Some(agent_frames) = frames.get(agent_id) else {
            return serde_json::json!({"files": []});
        };
        let mut names: Vec<&String> = agent_frames.keys().collect();
        names.sort();
        let files: Vec<serde_json::Value> = names
            .into_iter()
            .map(|name| {
                let frame = &agent_frames[name];
                let dtypes: serde_json::Map<String, serde_json::Value> = frame
                    .dtypes()
                    .into_iter()
                    .map(|(col, dtype)| (col, serde_json::Value::String(dtype.to_string())))
                    .collect();
                serde_json::json!({
                    "filename": name,
                    "rows": frame.n_rows(),
                    "columns": frame.columns,
                    "dtypes": dtypes,
                    "sample": frame.head(5).to_records(),
                })
            })
            .collect();
        serde_json::json!({ "files": files })
    }

    pub fn has_frames(&self, agent_id: &str) -> bool {
        self.frames
            .read()
            .expect("frame cache lock poisoned")
            .get(agent_id)
            .is_some_and(|m| !m.is_empty())
    }

    /// Runs one restricted query against the agent's (concatenated) frames.
    ///
    /// Never panics and never errors at the Rust level: every failure mode
    /// is folded into `QueryOutcome { success: false, error }`.
    pub fn execute_query(&self, agent_id: &str, raw_query: &str) -> QueryOutcome {
        let combined = {
            let frames = self.frames.read().expect("frame cache lock poisoned");
            let Some(agent_frames) = frames.get(agent_id).filter(|m| !m.is_empty()) else {
                return QueryOutcome::failure("No data files loaded for this agent");
            };
            let mut names: Vec<&String> = agent_frames.keys().collect();
            names.sort();
            let views: Vec<&Frame> = names.iter().map(|n| agent_frames[*n].as_ref()).collect();
            if views.len() == 1 {
                views[0].clone()
            } else {
                Frame::concat(&views)
            }
        };

        let lowered = raw_query.to_lowercase();
        if FORBIDDEN.iter().any(|token| lowered.contains(token)) {
            return QueryOutcome::failure("Query contains forbidden operations");
        }

        let mut cleaned = raw_query.trim();
        if let Some(stripped) = cleaned.strip_prefix("df.") {
            cleaned = stripped.trim();
        }
        if cleaned.is_empty() {
            return QueryOutcome::failure("Empty query");
        }

        // Allow-list gate on the first identifier; bracket-indexing forms
        // (and `df[...]`) pass without one.
        let head = cleaned
            .split('(')
            .next()
            .unwrap_or_default()
            .split('[')
            .next()
            .unwrap_or_default()
            .trim();
        let is_indexing = cleaned.starts_with('[') || head == "df";
        if !is_indexing && !ALLOWED_METHODS.contains(&head) {
            return QueryOutcome::failure(format!(
                "Método '{head}' não permitido. Use métodos como: head(), tail(), describe(), query(), etc."
            ));
        }

        match query::evaluate(&combined, cleaned) {
            Ok(value) => serialize_value(value),
            Err(e) => QueryOutcome::failure(format!(
                "Query execution error: {e}. Exemplos válidos: 'head(10)', 'describe()', \
                 \"query('coluna > 10')\", \"df[df['coluna'] == 'valor']\""
            )),
        }
    }
}

fn serialize_value(value: query::EvalValue) -> QueryOutcome {
    match value {
        query::EvalValue::Frame(frame) => QueryOutcome {
            success: true,
            rows: Some(frame.n_rows()),
            columns: Some(frame.columns.clone()),
            result: Some(serde_json::Value::Array(frame.to_records())),
            ..Default::default()
        },
        query::EvalValue::Series(series) => {
            let map: serde_json::Map<String, serde_json::Value> = series
                .labels
                .iter()
                .zip(series.values.iter())
                .map(|(label, cell)| (label.clone(), cell.to_json()))
                .collect();
            QueryOutcome {
                success: true,
                result: Some(serde_json::Value::Object(map)),
                kind: Some("series".into()),
                ..Default::default()
            }
        }
        query::EvalValue::Scalar(cell) => QueryOutcome {
            success: true,
            result: Some(serde_json::Value::String(cell.render())),
            kind: Some("scalar".into()),
            ..Default::default()
        },
        // evaluate() already rejects these; defensive mapping keeps the
        // envelope total.
        query::EvalValue::Grouped { .. } | query::EvalValue::Indexer(_) => {
            QueryOutcome::failure("Query execution error: incomplete expression")
        }
    }
}
