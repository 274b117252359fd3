pub mod agents;
pub mod builtin;
pub mod discovery;
pub mod registry;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

pub use registry::{Catalogue, CatalogueStats, RegisterOutcome};
pub use schema::{ParamSchema, ParamSpec, ParamType};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type Arguments = Map<String, Value>;

/// Where a tool's handler executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerLocation {
    Local,
    Remote { endpoint: String },
}

/// Public description of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub category: String,
    pub description: String,
    pub enabled: bool,
    pub handler_location: HandlerLocation,
    pub parameter_schema: ParamSchema,
    pub version: String,
}

impl ToolDescriptor {
    pub fn local(name: &str, category: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            description: description.to_string(),
            enabled: true,
            handler_location: HandlerLocation::Local,
            parameter_schema: ParamSchema::new(),
            version: "1.0.0".to_string(),
        }
    }

    pub fn remote(name: &str, category: &str, description: &str, endpoint: &str) -> Self {
        Self {
            handler_location: HandlerLocation::Remote {
                endpoint: endpoint.to_string(),
            },
            ..Self::local(name, category, description)
        }
    }

    pub fn with_schema(mut self, schema: ParamSchema) -> Self {
        self.parameter_schema = schema;
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.handler_location, HandlerLocation::Remote { .. })
    }

    /// Listing form sent over the protocol
    pub fn to_listing(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "category": self.category,
            "description": self.description,
            "enabled": self.enabled,
            "version": self.version,
            "remote": self.is_remote(),
            "inputSchema": self.parameter_schema.to_json_schema(),
        })
    }
}

/// In-process implementation of a tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Arguments) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a `ToolHandler`.
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F, Fut>
where
    F: Fn(Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, args: Arguments) -> Result<Value, HandlerError> {
        (self.f)(args).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}

pub(crate) fn str_arg<'a>(args: &'a Arguments, name: &str) -> Result<&'a str, HandlerError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing string argument '{}'", name).into())
}

pub(crate) fn u64_arg(args: &Arguments, name: &str) -> Result<u64, HandlerError> {
    args.get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("missing integer argument '{}'", name).into())
}

pub(crate) fn f64_arg(args: &Arguments, name: &str) -> Result<f64, HandlerError> {
    args.get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("missing numeric argument '{}'", name).into())
}
