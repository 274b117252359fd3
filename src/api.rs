use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::Dispatcher;
use crate::entity::Position;
use crate::error::ToolResult;
use crate::metrics::Metrics;
use crate::store::ToolConfigRecord;
use crate::tools::registry::{Catalogue, CatalogueStats};
use crate::tools::{Arguments, ToolDescriptor};
use crate::world::{AgentView, SimWorld, WorldStatus};

/// In-process control surface over the catalogue, the bridge and the world
#[derive(Clone)]
pub struct ControlApi {
    catalogue: Arc<Catalogue>,
    dispatcher: Arc<Dispatcher>,
    world: Arc<SimWorld>,
}

impl ControlApi {
    pub fn new(catalogue: Arc<Catalogue>, dispatcher: Arc<Dispatcher>, world: Arc<SimWorld>) -> Self {
        Self {
            catalogue,
            dispatcher,
            world,
        }
    }

    pub fn list_tools(&self, category: Option<&str>) -> Vec<ToolDescriptor> {
        self.catalogue.list(category)
    }

    /// Durable record of a registered tool
    pub fn tool_config(&self, name: &str) -> ToolResult<Option<ToolConfigRecord>> {
        self.catalogue.get(name)?;
        Ok(self.catalogue.store().get(name)?)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool, actor: &str) -> ToolResult<ToolDescriptor> {
        self.catalogue.set_enabled(name, enabled, actor)
    }

    pub fn tool_stats(&self) -> CatalogueStats {
        self.catalogue.stats()
    }

    pub async fn call_tool(
        &self,
        name: &str,
        args: Arguments,
        deadline: Option<Duration>,
    ) -> ToolResult<Value> {
        self.dispatcher.call(name, args, deadline).await
    }

    pub fn world_status(&self) -> WorldStatus {
        self.world.status()
    }

    pub fn set_acceleration(&self, factor: f64) -> ToolResult<f64> {
        self.world.set_acceleration(factor)
    }

    pub fn entities(&self) -> Vec<AgentView> {
        self.world.read(|s| s.agents())
    }

    pub fn positions(&self) -> Vec<(u64, Position)> {
        self.world.read(|s| s.positions())
    }

    pub fn metrics(&self) -> Metrics {
        self.dispatcher.metrics()
    }
}
