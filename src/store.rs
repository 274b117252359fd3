use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable enablement state of one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfigRecord {
    pub name: String,
    pub category: String,
    pub enabled: bool,
    pub last_modified: DateTime<Utc>,
    pub modified_by: String,
}

impl ToolConfigRecord {
    pub fn new(name: &str, category: &str, enabled: bool, actor: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            enabled,
            last_modified: Utc::now(),
            modified_by: actor.to_string(),
        }
    }
}

/// One `enabled` transition. `previous` is `None` when the record was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub tool_name: String,
    pub previous: Option<bool>,
    pub enabled: bool,
    pub actor: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    schema_version: u32,
    #[serde(default)]
    tools: Vec<ToolConfigRecord>,
    #[serde(default)]
    audit: Vec<AuditEntry>,
}

/// Source of truth for which tools are enabled.
#[cfg_attr(test, mockall::automock)]
pub trait ToolConfigStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<ToolConfigRecord>, StoreError>;

    fn get(&self, name: &str) -> Result<Option<ToolConfigRecord>, StoreError>;

    /// Replace the current record, appending an audit entry when the record is
    /// new or its `enabled` flag changed. Returns the appended entry, if any.
    fn upsert(&self, record: ToolConfigRecord) -> Result<Option<AuditEntry>, StoreError>;

    /// Audit entries for one tool, oldest first
    fn history(&self, name: &str) -> Result<Vec<AuditEntry>, StoreError>;
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    records: BTreeMap<String, ToolConfigRecord>,
    audit: Vec<AuditEntry>,
}

impl StoreState {
    fn from_document(doc: StoreDocument) -> Self {
        Self {
            records: doc
                .tools
                .into_iter()
                .map(|r| (r.name.clone(), r))
                .collect(),
            audit: doc.audit,
        }
    }

    fn to_document(&self) -> StoreDocument {
        StoreDocument {
            schema_version: SCHEMA_VERSION,
            tools: self.records.values().cloned().collect(),
            audit: self.audit.clone(),
        }
    }

    fn apply(&mut self, record: ToolConfigRecord) -> Option<AuditEntry> {
        let previous = self.records.get(&record.name).map(|r| r.enabled);
        let entry = match previous {
            Some(p) if p == record.enabled => None,
            _ => Some(AuditEntry {
                tool_name: record.name.clone(),
                previous,
                enabled: record.enabled,
                actor: record.modified_by.clone(),
                at: record.last_modified,
            }),
        };
        if let Some(e) = &entry {
            self.audit.push(e.clone());
        }
        self.records.insert(record.name.clone(), record);
        entry
    }

    fn history(&self, name: &str) -> Vec<AuditEntry> {
        self.audit
            .iter()
            .filter(|e| e.tool_name == name)
            .cloned()
            .collect()
    }
}

/// Store persisted as a single JSON document, rewritten atomically.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file is created with defaults; an
    /// unreadable or wrong-version file is moved aside to `<path>.bak`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }

        let state = match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<StoreDocument>(&data) {
                Ok(doc) if doc.schema_version == SCHEMA_VERSION => {
                    Some(StoreState::from_document(doc))
                }
                Ok(doc) => {
                    warn!(
                        path = %path.display(),
                        found = doc.schema_version,
                        expected = SCHEMA_VERSION,
                        "unsupported config store version, starting from defaults"
                    );
                    None
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config store unreadable, starting from defaults");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "creating config store");
                let state = StoreState::default();
                write_atomic(path, &state.to_document())?;
                return Ok(Self {
                    path: path.to_path_buf(),
                    state: Mutex::new(state),
                });
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config store unreadable, starting from defaults");
                None
            }
        };

        let state = match state {
            Some(s) => s,
            None => {
                move_aside(path);
                let s = StoreState::default();
                write_atomic(path, &s.to_document())?;
                s
            }
        };

        info!(
            path = %path.display(),
            tools = state.records.len(),
            audit = state.audit.len(),
            "config store loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ToolConfigStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<ToolConfigRecord>, StoreError> {
        Ok(self.state.lock().records.values().cloned().collect())
    }

    fn get(&self, name: &str) -> Result<Option<ToolConfigRecord>, StoreError> {
        Ok(self.state.lock().records.get(name).cloned())
    }

    fn upsert(&self, record: ToolConfigRecord) -> Result<Option<AuditEntry>, StoreError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let entry = next.apply(record);
        write_atomic(&self.path, &next.to_document())?;
        *state = next;
        Ok(entry)
    }

    fn history(&self, name: &str) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self.state.lock().history(name))
    }
}

/// Non-durable store for ephemeral runs
#[derive(Default)]
pub struct MemoryConfigStore {
    state: Mutex<StoreState>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ToolConfigStore for MemoryConfigStore {
    fn load_all(&self) -> Result<Vec<ToolConfigRecord>, StoreError> {
        Ok(self.state.lock().records.values().cloned().collect())
    }

    fn get(&self, name: &str) -> Result<Option<ToolConfigRecord>, StoreError> {
        Ok(self.state.lock().records.get(name).cloned())
    }

    fn upsert(&self, record: ToolConfigRecord) -> Result<Option<AuditEntry>, StoreError> {
        Ok(self.state.lock().apply(record))
    }

    fn history(&self, name: &str) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self.state.lock().history(name))
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn write_atomic(path: &Path, doc: &StoreDocument) -> Result<(), StoreError> {
    let data = serde_json::to_string_pretty(doc)?;
    let tmp = sibling(path, ".tmp");
    fs::write(&tmp, data).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })
}

fn move_aside(path: &Path) {
    let backup = sibling(path, ".bak");
    match fs::rename(path, &backup) {
        Ok(()) => warn!(backup = %backup.display(), "previous config store moved aside"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not move config store aside"),
    }
}
