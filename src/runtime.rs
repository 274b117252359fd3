use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::ControlApi;
use crate::bridge::{BridgePolicy, Dispatcher};
use crate::config::{Config, ConfigError};
use crate::error::{ToolError, ToolResult};
use crate::protocol::{RpcRequest, METHOD_TOOLS_LIST};
use crate::server::RpcServer;
use crate::store::{JsonFileStore, MemoryConfigStore, StoreError, ToolConfigStore};
use crate::tools::agents::register_agent_tools;
use crate::tools::builtin::{builtin_handlers, register_builtin_tools};
use crate::tools::discovery::{Discovery, DiscoveryReport};
use crate::tools::registry::Catalogue;
use crate::tools::{ParamSchema, ToolDescriptor};
use crate::transport::{Connector, DefaultConnector};
use crate::world::{SimWorld, SpawnSpec, WorldDriver, WorldState};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tool entry as listed by an upstream backend
#[derive(Debug, Deserialize)]
struct UpstreamTool {
    name: String,
    #[serde(default = "default_upstream_category")]
    category: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_upstream_version")]
    version: String,
}

fn default_upstream_category() -> String {
    "remote".to_string()
}

fn default_upstream_version() -> String {
    "1.0.0".to_string()
}

/// Every service of one process, wired from a `Config`
pub struct Runtime {
    config: Config,
    catalogue: Arc<Catalogue>,
    discovery: Discovery,
    world: Arc<SimWorld>,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<Dispatcher>,
    server: Arc<RpcServer>,
    driver: Option<WorldDriver>,
}

impl Runtime {
    /// Build with the TCP/stdio connector from the bridge settings
    pub fn build(config: Config) -> Result<Self, RuntimeError> {
        let connector = Arc::new(DefaultConnector::new(Duration::from_millis(
            config.bridge.connect_timeout_ms,
        )));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(
        config: Config,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let store: Arc<dyn ToolConfigStore> = if config.store.in_memory {
            info!("tool configuration kept in memory");
            Arc::new(MemoryConfigStore::new())
        } else {
            Arc::new(JsonFileStore::open(&config.store.path)?)
        };
        let catalogue = Arc::new(Catalogue::new(store));

        let mut state = WorldState::from_config(&config.simulation)?;
        for _ in 0..config.simulation.initial_agents {
            state.spawn(SpawnSpec::default());
        }
        let world = Arc::new(SimWorld::new(state));

        register_builtin_tools(&catalogue)?;
        register_agent_tools(&catalogue, &world)?;

        let discovery = Discovery::new(
            catalogue.clone(),
            builtin_handlers(),
            config.discovery.max_files,
        );
        discovery.discover(&config.discovery.roots);

        let dispatcher = Arc::new(Dispatcher::new(
            catalogue.clone(),
            connector.clone(),
            BridgePolicy::from(&config.bridge),
        ));
        let server = Arc::new(RpcServer::new(dispatcher.clone(), config.server.workers));

        info!(
            tools = catalogue.len(),
            agents = config.simulation.initial_agents,
            acceleration = config.simulation.acceleration,
            "runtime ready"
        );

        Ok(Self {
            config,
            catalogue,
            discovery,
            world,
            connector,
            dispatcher,
            server,
            driver: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    pub fn world(&self) -> &Arc<SimWorld> {
        &self.world
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn server(&self) -> &Arc<RpcServer> {
        &self.server
    }

    pub fn api(&self) -> ControlApi {
        ControlApi::new(
            self.catalogue.clone(),
            self.dispatcher.clone(),
            self.world.clone(),
        )
    }

    /// Rescan the configured discovery roots
    pub fn rediscover(&self) -> DiscoveryReport {
        self.discovery.discover(&self.config.discovery.roots)
    }

    /// Start the world tick loop. No-op if already running.
    pub fn start_world(&mut self) {
        if self.driver.is_none() {
            let interval = Duration::from_millis(self.config.simulation.tick_interval_ms);
            self.driver = Some(WorldDriver::spawn(self.world.clone(), interval));
        }
    }

    /// Register the tools of the upstream backend as remote tools.
    /// Names already in the catalogue keep their local definition.
    pub async fn import_upstream(&self) -> ToolResult<usize> {
        let Some(endpoint) = self.config.bridge.endpoint.clone() else {
            return Ok(0);
        };
        let unavailable = || ToolError::BridgeUnavailable {
            endpoint: endpoint.clone(),
            attempts: 1,
        };

        let limit = self.config.bridge.timeout();
        let listing = tokio::time::timeout(limit, async {
            let channel = self.connector.connect(&endpoint).await.map_err(|e| {
                warn!(endpoint = %endpoint, error = %e, "upstream unreachable");
                unavailable()
            })?;
            channel
                .call(RpcRequest::new(
                    METHOD_TOOLS_LIST,
                    json!({ "enabled_only": true }),
                    json!("import"),
                ))
                .await
                .map_err(|e| {
                    warn!(endpoint = %endpoint, error = %e, "upstream listing failed");
                    unavailable()
                })
        })
        .await
        .map_err(|_| ToolError::Timeout(limit))??;

        if let Some(err) = listing.error {
            return Err(ToolError::from_wire(err.code, err.message));
        }
        let tools = listing
            .result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();

        let mut imported = 0;
        for raw in tools {
            let tool: UpstreamTool = match serde_json::from_value(raw) {
                Ok(t) => t,
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "skipping malformed upstream tool");
                    continue;
                }
            };
            // The upstream validates its own arguments
            let descriptor =
                ToolDescriptor::remote(&tool.name, &tool.category, &tool.description, &endpoint)
                    .with_schema(ParamSchema::new().open())
                    .with_version(&tool.version);
            match self.catalogue.register(descriptor, None, false) {
                Ok(_) => imported += 1,
                Err(e) => warn!(tool = %tool.name, error = %e, "upstream tool not imported"),
            }
        }
        info!(endpoint = %endpoint, imported, "upstream tools imported");
        Ok(imported)
    }

    /// Serve on stdio until the input closes, then shut down.
    pub async fn run_stdio(mut self) -> Result<(), RuntimeError> {
        self.start_world();
        let result = self.server.clone().serve_stdio().await;
        self.shutdown().await;
        Ok(result?)
    }

    /// Serve TCP on `addr` until `shutdown` flips to true.
    pub async fn run_tcp(
        mut self,
        addr: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), RuntimeError> {
        let listener = TcpListener::bind(addr).await?;
        self.start_world();
        let result = self.server.clone().serve_tcp(listener, shutdown).await;
        self.shutdown().await;
        Ok(result?)
    }

    /// Stop the world driver
    pub async fn shutdown(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.stop().await;
        }
        let metrics = self.dispatcher.metrics();
        info!(
            dispatched = metrics.dispatch_total,
            failed = metrics.dispatch_failed,
            "runtime stopped"
        );
    }
}
