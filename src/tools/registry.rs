use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use super::schema::{validate_tool_name, validate_version};
use super::{HandlerLocation, ToolDescriptor, ToolHandler};
use crate::error::{ToolError, ToolResult};
use crate::store::{AuditEntry, ToolConfigRecord, ToolConfigStore};

pub const SYSTEM_ACTOR: &str = "system";

/// A registered tool: its descriptor plus the in-process handler, if local.
pub struct CatalogueEntry {
    pub descriptor: ToolDescriptor,
    pub handler: Option<Arc<dyn ToolHandler>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    Added,
    Replaced,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategoryStats {
    pub total: usize,
    pub enabled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogueStats {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub remote: usize,
    pub categories: BTreeMap<String, CategoryStats>,
}

/// Authoritative table of tools.
///
/// Reads take the table's read lock and clone out what they need. Writers
/// serialize on `writer`, persist to the configuration store first and only
/// then swap the in-memory entry, so a failed durable write changes nothing.
pub struct Catalogue {
    tools: RwLock<HashMap<String, Arc<CatalogueEntry>>>,
    writer: Mutex<()>,
    store: Arc<dyn ToolConfigStore>,
}

impl Catalogue {
    pub fn new(store: Arc<dyn ToolConfigStore>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn ToolConfigStore> {
        &self.store
    }

    /// Register a tool. Fails with `DuplicateTool` when the name exists and
    /// `replace` is false. Durable enablement and category win over the
    /// descriptor's defaults; a tool seen for the first time gets a record.
    pub fn register(
        &self,
        mut descriptor: ToolDescriptor,
        handler: Option<Arc<dyn ToolHandler>>,
        replace: bool,
    ) -> ToolResult<RegisterOutcome> {
        validate_tool_name(&descriptor.name).map_err(ToolError::Validation)?;
        validate_version(&descriptor.version).map_err(ToolError::Validation)?;
        descriptor
            .parameter_schema
            .validate_definition()
            .map_err(ToolError::Validation)?;
        let handler = match (&descriptor.handler_location, handler) {
            (HandlerLocation::Local, None) => {
                return Err(ToolError::Validation(format!(
                    "local tool '{}' has no handler",
                    descriptor.name
                )));
            }
            (HandlerLocation::Local, Some(h)) => Some(h),
            (HandlerLocation::Remote { endpoint }, _) => {
                if endpoint.trim().is_empty() {
                    return Err(ToolError::Validation(format!(
                        "remote tool '{}' has no endpoint",
                        descriptor.name
                    )));
                }
                None
            }
        };

        let _guard = self.writer.lock();
        let exists = self.tools.read().contains_key(&descriptor.name);
        if exists && !replace {
            return Err(ToolError::DuplicateTool(descriptor.name));
        }

        match self.store.get(&descriptor.name)? {
            Some(record) => {
                descriptor.enabled = record.enabled;
                descriptor.category = record.category;
            }
            None => {
                self.store.upsert(ToolConfigRecord::new(
                    &descriptor.name,
                    &descriptor.category,
                    descriptor.enabled,
                    SYSTEM_ACTOR,
                ))?;
            }
        }

        let name = descriptor.name.clone();
        info!(
            tool = %name,
            category = %descriptor.category,
            enabled = descriptor.enabled,
            remote = descriptor.is_remote(),
            replaced = exists,
            "registering tool"
        );
        self.tools
            .write()
            .insert(name, Arc::new(CatalogueEntry { descriptor, handler }));

        Ok(if exists {
            RegisterOutcome::Replaced
        } else {
            RegisterOutcome::Added
        })
    }

    pub fn get(&self, name: &str) -> ToolResult<ToolDescriptor> {
        self.tools
            .read()
            .get(name)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| ToolError::NotFound(format!("tool '{}'", name)))
    }

    /// Descriptor and handler together, for dispatch
    pub fn resolve(&self, name: &str) -> ToolResult<Arc<CatalogueEntry>> {
        self.tools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(format!("tool '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// All tools, or those in one category, sorted by name
    pub fn list(&self, category: Option<&str>) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self
            .tools
            .read()
            .values()
            .filter(|e| category.map_or(true, |c| e.descriptor.category == c))
            .map(|e| e.descriptor.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn categories(&self) -> Vec<String> {
        let mut cats: Vec<String> = self
            .tools
            .read()
            .values()
            .map(|e| e.descriptor.category.clone())
            .collect();
        cats.sort();
        cats.dedup();
        cats
    }

    /// Persist the new flag, then swap the in-memory descriptor.
    pub fn set_enabled(&self, name: &str, enabled: bool, actor: &str) -> ToolResult<ToolDescriptor> {
        let _guard = self.writer.lock();
        let current = self.resolve(name)?;
        self.write_flag(&current, enabled, actor)
    }

    pub fn toggle(&self, name: &str, actor: &str) -> ToolResult<ToolDescriptor> {
        let _guard = self.writer.lock();
        let current = self.resolve(name)?;
        let enabled = !current.descriptor.enabled;
        self.write_flag(&current, enabled, actor)
    }

    fn write_flag(
        &self,
        current: &CatalogueEntry,
        enabled: bool,
        actor: &str,
    ) -> ToolResult<ToolDescriptor> {
        let name = &current.descriptor.name;
        self.store.upsert(ToolConfigRecord::new(
            name,
            &current.descriptor.category,
            enabled,
            actor,
        ))?;

        let mut descriptor = current.descriptor.clone();
        descriptor.enabled = enabled;
        self.tools.write().insert(
            name.clone(),
            Arc::new(CatalogueEntry {
                descriptor: descriptor.clone(),
                handler: current.handler.clone(),
            }),
        );
        if enabled {
            info!(tool = %name, actor = %actor, "tool enabled");
        } else {
            warn!(tool = %name, actor = %actor, "tool disabled");
        }
        Ok(descriptor)
    }

    /// Re-derive in-memory flags and categories from the durable store.
    /// Returns how many tools changed.
    pub fn reload(&self) -> ToolResult<usize> {
        let _guard = self.writer.lock();
        let records = self.store.load_all()?;
        let mut tools = self.tools.write();
        let mut changed = 0;
        for record in records {
            let Some(entry) = tools.get(&record.name) else {
                continue;
            };
            if entry.descriptor.enabled == record.enabled
                && entry.descriptor.category == record.category
            {
                continue;
            }
            let mut descriptor = entry.descriptor.clone();
            descriptor.enabled = record.enabled;
            descriptor.category = record.category;
            let handler = entry.handler.clone();
            tools.insert(
                record.name,
                Arc::new(CatalogueEntry {
                    descriptor,
                    handler,
                }),
            );
            changed += 1;
        }
        info!(changed, "tool configuration reloaded");
        Ok(changed)
    }

    pub fn history(&self, name: &str) -> ToolResult<Vec<AuditEntry>> {
        if !self.contains(name) {
            return Err(ToolError::NotFound(format!("tool '{}'", name)));
        }
        Ok(self.store.history(name)?)
    }

    pub fn stats(&self) -> CatalogueStats {
        let tools = self.tools.read();
        let mut stats = CatalogueStats::default();
        for entry in tools.values() {
            let d = &entry.descriptor;
            stats.total += 1;
            if d.enabled {
                stats.enabled += 1;
            } else {
                stats.disabled += 1;
            }
            if d.is_remote() {
                stats.remote += 1;
            }
            let cat = stats.categories.entry(d.category.clone()).or_default();
            cat.total += 1;
            if d.enabled {
                cat.enabled += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConfigStore, MockToolConfigStore, StoreError};
    use crate::tools::{handler_fn, Arguments, HandlerError};
    use serde_json::Value;

    fn echo() -> Arc<dyn ToolHandler> {
        handler_fn(|args: Arguments| async move { Ok::<_, HandlerError>(Value::Object(args)) })
    }

    fn catalogue() -> Catalogue {
        Catalogue::new(Arc::new(MemoryConfigStore::new()))
    }

    #[test]
    fn test_register_and_get() {
        let cat = catalogue();
        let outcome = cat
            .register(ToolDescriptor::local("echo", "utility", "echo"), Some(echo()), false)
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Added);
        assert_eq!(cat.get("echo").unwrap().category, "utility");
        assert!(matches!(cat.get("nope"), Err(ToolError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_rejected_unless_replace() {
        let cat = catalogue();
        cat.register(ToolDescriptor::local("echo", "utility", "v1"), Some(echo()), false)
            .unwrap();
        let err = cat
            .register(ToolDescriptor::local("echo", "utility", "v2"), Some(echo()), false)
            .unwrap_err();
        assert_eq!(err, ToolError::DuplicateTool("echo".into()));
        assert_eq!(cat.get("echo").unwrap().description, "v1");

        let outcome = cat
            .register(ToolDescriptor::local("echo", "utility", "v2"), Some(echo()), true)
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Replaced);
        assert_eq!(cat.get("echo").unwrap().description, "v2");
        assert_eq!(cat.len(), 1);
    }

    #[test]
    fn test_invalid_descriptors_rejected() {
        let cat = catalogue();
        assert!(matches!(
            cat.register(ToolDescriptor::local("bad name", "u", ""), Some(echo()), false),
            Err(ToolError::Validation(_))
        ));
        assert!(matches!(
            cat.register(ToolDescriptor::local("nohandler", "u", ""), None, false),
            Err(ToolError::Validation(_))
        ));
        assert!(matches!(
            cat.register(
                ToolDescriptor::local("v", "u", "").with_version("one"),
                Some(echo()),
                false
            ),
            Err(ToolError::Validation(_))
        ));
        assert!(cat.is_empty());
    }

    #[test]
    fn test_durable_state_wins_on_register() {
        let store = Arc::new(MemoryConfigStore::new());
        store
            .upsert(ToolConfigRecord::new("echo", "ops", false, "alice"))
            .unwrap();
        let cat = Catalogue::new(store);
        cat.register(ToolDescriptor::local("echo", "utility", ""), Some(echo()), false)
            .unwrap();
        let d = cat.get("echo").unwrap();
        assert!(!d.enabled);
        assert_eq!(d.category, "ops");
    }

    #[test]
    fn test_toggle_and_history() {
        let cat = catalogue();
        cat.register(ToolDescriptor::local("echo", "utility", ""), Some(echo()), false)
            .unwrap();
        assert!(!cat.toggle("echo", "bob").unwrap().enabled);
        assert!(cat.toggle("echo", "bob").unwrap().enabled);
        // seed + two flips
        assert_eq!(cat.history("echo").unwrap().len(), 3);
        assert!(matches!(cat.set_enabled("nope", true, "x"), Err(ToolError::NotFound(_))));
    }

    #[test]
    fn test_failed_write_keeps_memory() {
        let mut store = MockToolConfigStore::new();
        store.expect_get().returning(|_| Ok(None));
        let mut seeded = false;
        store.expect_upsert().returning(move |_| {
            if seeded {
                Err(StoreError::Io {
                    path: "tools.json".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                })
            } else {
                seeded = true;
                Ok(None)
            }
        });
        let cat = Catalogue::new(Arc::new(store));
        cat.register(ToolDescriptor::local("echo", "utility", ""), Some(echo()), false)
            .unwrap();

        let err = cat.set_enabled("echo", false, "bob").unwrap_err();
        assert!(matches!(err, ToolError::Storage(_)));
        assert!(cat.get("echo").unwrap().enabled);
    }

    #[test]
    fn test_reload_picks_up_external_change() {
        let store = Arc::new(MemoryConfigStore::new());
        let cat = Catalogue::new(store.clone());
        cat.register(ToolDescriptor::local("echo", "utility", ""), Some(echo()), false)
            .unwrap();
        store
            .upsert(ToolConfigRecord::new("echo", "utility", false, "ops"))
            .unwrap();
        assert!(cat.get("echo").unwrap().enabled);
        assert_eq!(cat.reload().unwrap(), 1);
        assert!(!cat.get("echo").unwrap().enabled);
    }

    #[test]
    fn test_list_and_stats() {
        let cat = catalogue();
        cat.register(ToolDescriptor::local("b", "x", ""), Some(echo()), false)
            .unwrap();
        cat.register(ToolDescriptor::local("a", "x", ""), Some(echo()), false)
            .unwrap();
        cat.register(
            ToolDescriptor::remote("c", "y", "", "tcp://127.0.0.1:1").disabled(),
            None,
            false,
        )
        .unwrap();

        let names: Vec<String> = cat.list(None).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(cat.list(Some("y")).len(), 1);
        assert_eq!(cat.categories(), vec!["x".to_string(), "y".to_string()]);

        let stats = cat.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.enabled, 2);
        assert_eq!(stats.disabled, 1);
        assert_eq!(stats.remote, 1);
        assert_eq!(stats.categories["x"].enabled, 2);
    }
}
