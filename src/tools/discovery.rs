//! Manifest-based tool discovery.
//!
//! Source roots are scanned for `*.tool.toml` files. Each file declares one
//! or more tools:
//!
//! ```toml
//! [[tool]]
//! name = "weather"
//! category = "external"
//! version = "1.0.0"
//! description = "Current weather for a city"
//! endpoint = "tcp://127.0.0.1:7401"   # or: handler = "echo"
//!
//! [tool.params.city]
//! type = "string"
//! required = true
//! ```
//!
//! Bad files and bad entries are logged and skipped; the rest still register.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::{Catalogue, RegisterOutcome};
use super::schema::{ParamSchema, ParamSpec};
use super::{HandlerLocation, ToolDescriptor, ToolHandler};
use crate::error::ToolError;

pub const MANIFEST_SUFFIX: &str = ".tool.toml";

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    tool: Vec<ToolManifest>,
}

#[derive(Debug, Deserialize)]
struct ToolManifest {
    name: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_true")]
    enabled: bool,
    handler: Option<String>,
    endpoint: Option<String>,
    #[serde(default)]
    params: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    allow_extra: bool,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

/// Named local handlers that manifests may bind to
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedTool {
    pub source: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub files_scanned: usize,
    pub registered: Vec<String>,
    pub replaced: Vec<String>,
    pub skipped: Vec<SkippedTool>,
    /// The file limit was hit before every root was scanned
    pub truncated: bool,
}

pub struct Discovery {
    catalogue: Arc<Catalogue>,
    handlers: HandlerTable,
    max_files: usize,
    /// Tools this discovery registered; only these may be replaced on rescan
    owned: Mutex<HashSet<String>>,
}

impl Discovery {
    pub fn new(catalogue: Arc<Catalogue>, handlers: HandlerTable, max_files: usize) -> Self {
        Self {
            catalogue,
            handlers,
            max_files,
            owned: Mutex::new(HashSet::new()),
        }
    }

    /// Scan the roots and register every valid declared tool.
    pub fn discover(&self, roots: &[PathBuf]) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut files = Vec::new();
        let mut visited = HashSet::new();
        for root in roots {
            if !collect_manifests(root, self.max_files, &mut files, &mut visited) {
                report.truncated = true;
                break;
            }
        }
        if report.truncated {
            warn!(max_files = self.max_files, "manifest limit reached, remaining files ignored");
        }

        for file in files {
            report.files_scanned += 1;
            self.load_file(&file, &mut report);
        }

        info!(
            files = report.files_scanned,
            registered = report.registered.len(),
            replaced = report.replaced.len(),
            skipped = report.skipped.len(),
            "tool discovery finished"
        );
        report
    }

    fn load_file(&self, path: &Path, report: &mut DiscoveryReport) {
        let parsed = fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|data| toml::from_str::<ManifestFile>(&data).map_err(|e| e.to_string()));
        let manifest = match parsed {
            Ok(m) => m,
            Err(reason) => {
                warn!(path = %path.display(), error = %reason, "skipping unreadable manifest");
                report.skipped.push(SkippedTool {
                    source: path.to_path_buf(),
                    tool: None,
                    reason,
                });
                return;
            }
        };

        for tool in manifest.tool {
            let name = tool.name.clone();
            match self.register_manifest(tool) {
                Ok(RegisterOutcome::Added) => report.registered.push(name),
                Ok(RegisterOutcome::Replaced) => report.replaced.push(name),
                Err(e) => {
                    warn!(path = %path.display(), tool = %name, error = %e, "skipping invalid tool");
                    report.skipped.push(SkippedTool {
                        source: path.to_path_buf(),
                        tool: Some(name),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn register_manifest(&self, tool: ToolManifest) -> Result<RegisterOutcome, ToolError> {
        let (location, handler) = match (tool.handler, tool.endpoint) {
            (Some(_), Some(_)) => {
                return Err(ToolError::Validation(
                    "declare either handler or endpoint, not both".into(),
                ))
            }
            (None, None) => {
                return Err(ToolError::Validation("no handler or endpoint declared".into()))
            }
            (Some(h), None) => {
                let resolved = self
                    .handlers
                    .get(&h)
                    .ok_or_else(|| ToolError::Validation(format!("unknown handler '{}'", h)))?;
                (HandlerLocation::Local, Some(resolved))
            }
            (None, Some(endpoint)) => (HandlerLocation::Remote { endpoint }, None),
        };

        let descriptor = ToolDescriptor {
            name: tool.name,
            category: tool.category,
            description: tool.description,
            enabled: tool.enabled,
            handler_location: location,
            parameter_schema: ParamSchema {
                params: tool.params,
                allow_extra: tool.allow_extra,
            },
            version: tool.version,
        };

        let mut owned = self.owned.lock();
        let replace = owned.contains(&descriptor.name);
        let name = descriptor.name.clone();
        let outcome = self.catalogue.register(descriptor, handler, replace)?;
        owned.insert(name);
        Ok(outcome)
    }
}

/// Depth-first, name-ordered walk. Returns false once `limit` files were found.
/// Each directory is entered once by canonical path, so symlink cycles end.
fn collect_manifests(
    dir: &Path,
    limit: usize,
    out: &mut Vec<PathBuf>,
    visited: &mut HashSet<PathBuf>,
) -> bool {
    match fs::canonicalize(dir) {
        Ok(canonical) => {
            if !visited.insert(canonical) {
                debug!(dir = %dir.display(), "directory already scanned");
                return true;
            }
        }
        Err(e) => {
            warn!(root = %dir.display(), error = %e, "cannot read discovery root");
            return true;
        }
    }
    let mut entries: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(e) => {
            warn!(root = %dir.display(), error = %e, "cannot read discovery root");
            return true;
        }
    };
    entries.sort();

    for path in entries {
        if path.is_dir() {
            if !collect_manifests(&path, limit, out, visited) {
                return false;
            }
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.ends_with(MANIFEST_SUFFIX))
        {
            if out.len() >= limit {
                return false;
            }
            debug!(path = %path.display(), "found tool manifest");
            out.push(path);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConfigStore;
    use crate::tools::{handler_fn, Arguments, HandlerError};
    use serde_json::Value;
    use tempfile::tempdir;

    fn setup(max_files: usize) -> (Arc<Catalogue>, Discovery) {
        let cat = Arc::new(Catalogue::new(Arc::new(MemoryConfigStore::new())));
        let mut handlers = HandlerTable::new();
        handlers.insert(
            "echo",
            handler_fn(|args: Arguments| async move { Ok::<_, HandlerError>(Value::Object(args)) }),
        );
        let discovery = Discovery::new(cat.clone(), handlers, max_files);
        (cat, discovery)
    }

    const GOOD: &str = r#"
[[tool]]
name = "weather"
category = "external"
description = "Weather lookup"
endpoint = "tcp://127.0.0.1:7401"

[tool.params.city]
type = "string"
required = true

[[tool]]
name = "shout"
handler = "echo"

[[tool]]
name = "broken"
handler = "does_not_exist"
"#;

    #[test]
    fn test_discover_registers_valid_and_skips_invalid() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.tool.toml"), GOOD).unwrap();
        fs::write(dir.path().join("b.tool.toml"), "[[tool]\nname=").unwrap();
        fs::write(dir.path().join("ignored.toml"), GOOD).unwrap();

        let (cat, discovery) = setup(100);
        let report = discovery.discover(&[dir.path().to_path_buf()]);

        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.registered, vec!["weather", "shout"]);
        assert_eq!(report.skipped.len(), 2);
        assert!(cat.get("weather").unwrap().is_remote());
        assert_eq!(cat.get("shout").unwrap().category, "general");
        assert!(cat.get("weather").unwrap().parameter_schema.params["city"].required);
    }

    #[test]
    fn test_rediscovery_is_idempotent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.tool.toml"), GOOD).unwrap();
        let (cat, discovery) = setup(100);
        discovery.discover(&[dir.path().to_path_buf()]);
        let report = discovery.discover(&[dir.path().to_path_buf()]);
        assert!(report.registered.is_empty());
        assert_eq!(report.replaced, vec!["weather", "shout"]);
        assert_eq!(cat.len(), 2);
    }

    #[test]
    fn test_file_limit_and_nested_dirs() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("x").join("y");
        fs::create_dir_all(&nested).unwrap();
        for i in 0..3 {
            fs::write(
                nested.join(format!("t{}.tool.toml", i)),
                format!("[[tool]]\nname = \"t{}\"\nhandler = \"echo\"\n", i),
            )
            .unwrap();
        }
        let (cat, discovery) = setup(2);
        let report = discovery.discover(&[dir.path().to_path_buf()]);
        assert!(report.truncated);
        assert_eq!(report.files_scanned, 2);
        assert_eq!(cat.len(), 2);
    }

    #[test]
    fn test_missing_root_is_not_fatal() {
        let (_, discovery) = setup(10);
        let report = discovery.discover(&[PathBuf::from("/definitely/not/here")]);
        assert_eq!(report.files_scanned, 0);
        assert!(!report.truncated);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_terminates() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("t.tool.toml"),
            "[[tool]]\nname = \"looped\"\nhandler = \"echo\"\n",
        )
        .unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("a")).unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("b")).unwrap();

        let (cat, discovery) = setup(10);
        let report = discovery.discover(&[dir.path().to_path_buf()]);
        assert_eq!(report.files_scanned, 1);
        assert!(!report.truncated);
        assert!(cat.contains("looped"));
    }
}
