use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

use super::discovery::HandlerTable;
use super::registry::Catalogue;
use super::schema::{ParamSchema, ParamType};
use super::{handler_fn, str_arg, Arguments, HandlerError, ToolDescriptor, ToolHandler};
use crate::error::ToolResult;

pub const DEFAULT_ACTOR: &str = "api";

fn echo_handler() -> Arc<dyn ToolHandler> {
    handler_fn(|args: Arguments| async move { Ok::<_, HandlerError>(Value::Object(args)) })
}

fn time_handler() -> Arc<dyn ToolHandler> {
    handler_fn(|args: Arguments| async move {
        let now = Utc::now();
        let format = args.get("format").and_then(Value::as_str).unwrap_or("rfc3339");
        let formatted = match format {
            "rfc3339" => now.to_rfc3339(),
            "unix" => now.timestamp().to_string(),
            other => return Err(HandlerError::from(format!("unsupported format '{}'", other))),
        };
        Ok(json!({
            "time": formatted,
            "unix": now.timestamp(),
            "timezone": "UTC",
        }))
    })
}

/// Handlers that manifests can bind to by name
pub fn builtin_handlers() -> HandlerTable {
    let mut table = HandlerTable::new();
    table.insert("echo", echo_handler());
    table.insert("get_current_time", time_handler());
    table
}

#[derive(Debug, Clone, Copy)]
enum ConfigOp {
    List,
    Get,
    Enable,
    Disable,
    Toggle,
    Stats,
    History,
    Reload,
}

/// Tools that manage the catalogue itself. Holds a weak handle since the
/// catalogue owns this handler.
struct ConfigTool {
    catalogue: Weak<Catalogue>,
    op: ConfigOp,
}

#[async_trait]
impl ToolHandler for ConfigTool {
    async fn call(&self, args: Arguments) -> Result<Value, HandlerError> {
        let catalogue = self
            .catalogue
            .upgrade()
            .ok_or("tool catalogue is shutting down")?;
        let actor = args
            .get("actor")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_ACTOR);

        let value = match self.op {
            ConfigOp::List => {
                let category = args.get("category").and_then(Value::as_str);
                let tools: Vec<Value> = catalogue
                    .list(category)
                    .iter()
                    .map(|d| {
                        json!({
                            "name": d.name,
                            "category": d.category,
                            "enabled": d.enabled,
                            "version": d.version,
                        })
                    })
                    .collect();
                json!({ "tools": tools, "count": tools.len() })
            }
            ConfigOp::Get => {
                let name = str_arg(&args, "tool_name")?;
                let descriptor = catalogue.get(name)?;
                let record = catalogue.store().get(name)?;
                json!({ "descriptor": descriptor, "record": record })
            }
            ConfigOp::Enable => {
                let d = catalogue.set_enabled(str_arg(&args, "tool_name")?, true, actor)?;
                json!({ "name": d.name, "enabled": d.enabled })
            }
            ConfigOp::Disable => {
                let d = catalogue.set_enabled(str_arg(&args, "tool_name")?, false, actor)?;
                json!({ "name": d.name, "enabled": d.enabled })
            }
            ConfigOp::Toggle => {
                let d = catalogue.toggle(str_arg(&args, "tool_name")?, actor)?;
                json!({ "name": d.name, "enabled": d.enabled })
            }
            ConfigOp::Stats => serde_json::to_value(catalogue.stats())?,
            ConfigOp::History => {
                let history = catalogue.history(str_arg(&args, "tool_name")?)?;
                json!({ "history": history })
            }
            ConfigOp::Reload => json!({ "changed": catalogue.reload()? }),
        };
        Ok(value)
    }
}

/// Register the always-present local tools.
pub fn register_builtin_tools(catalogue: &Arc<Catalogue>) -> ToolResult<()> {
    catalogue.register(
        ToolDescriptor::local("echo", "utility", "Return the arguments unchanged")
            .with_schema(ParamSchema::new().open()),
        Some(echo_handler()),
        false,
    )?;
    catalogue.register(
        ToolDescriptor::local("get_current_time", "utility", "Current UTC time")
            .with_schema(ParamSchema::new().optional(
                "format",
                ParamType::String,
                "rfc3339 (default) or unix",
            )),
        Some(time_handler()),
        false,
    )?;

    let name_param = || {
        ParamSchema::new()
            .required("tool_name", ParamType::String, "Tool to act on")
            .optional("actor", ParamType::String, "Who made the change")
    };
    let config_tools = [
        (
            "list_tool_configs",
            "List tools and their enabled state",
            ConfigOp::List,
            ParamSchema::new().optional("category", ParamType::String, "Only this category"),
        ),
        ("get_tool_config", "Show one tool's configuration", ConfigOp::Get, name_param()),
        ("enable_tool", "Enable a tool", ConfigOp::Enable, name_param()),
        ("disable_tool", "Disable a tool", ConfigOp::Disable, name_param()),
        ("toggle_tool", "Flip a tool's enabled state", ConfigOp::Toggle, name_param()),
        ("get_tool_stats", "Tool counts by state and category", ConfigOp::Stats, ParamSchema::new()),
        ("get_tool_history", "Audit trail of a tool's enabled state", ConfigOp::History, name_param()),
        ("reload_tool_config", "Reload enabled state from the store", ConfigOp::Reload, ParamSchema::new()),
    ];
    for (name, description, op, schema) in config_tools {
        catalogue.register(
            ToolDescriptor::local(name, "tool_config", description).with_schema(schema),
            Some(Arc::new(ConfigTool {
                catalogue: Arc::downgrade(catalogue),
                op,
            })),
            false,
        )?;
    }
    Ok(())
}
