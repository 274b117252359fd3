use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const ENV_PREFIX: &str = "TOOLWORLD_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_acceleration")]
    pub acceleration: f64,
    #[serde(default = "default_max_acceleration")]
    pub max_acceleration: f64,
    /// Simulated seconds per fixed step
    #[serde(default = "default_fixed_step")]
    pub fixed_step: f64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_maturity_age")]
    pub maturity_age: f64,
    #[serde(default = "default_reproduction_cooldown")]
    pub reproduction_cooldown: f64,
    #[serde(default = "default_compatibility_threshold")]
    pub compatibility_threshold: f64,
    #[serde(default = "default_mating_radius")]
    pub mating_radius: f64,
    #[serde(default = "default_max_population")]
    pub max_population: usize,
    #[serde(default = "default_inheritance_weight")]
    pub inheritance_weight: f64,
    #[serde(default = "default_mutation_bound")]
    pub mutation_bound: f64,
    #[serde(default = "default_world_size")]
    pub world_width: f64,
    #[serde(default = "default_world_size")]
    pub world_height: f64,
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    /// Fixed RNG seed; random when absent
    #[serde(default)]
    pub seed: Option<u64>,
    /// Agents spawned at startup
    #[serde(default)]
    pub initial_agents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_roots")]
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Default deadline for a dispatch
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upstream backend whose tools are imported as remote tools
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Keep tool configuration in memory only
    #[serde(default)]
    pub in_memory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Concurrent dispatches per connection
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub listen: Option<String>,
}

fn default_acceleration() -> f64 {
    1.0
}

fn default_max_acceleration() -> f64 {
    100.0
}

fn default_fixed_step() -> f64 {
    0.25
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_maturity_age() -> f64 {
    18.0
}

fn default_reproduction_cooldown() -> f64 {
    10.0
}

fn default_compatibility_threshold() -> f64 {
    0.6
}

fn default_mating_radius() -> f64 {
    75.0
}

fn default_max_population() -> usize {
    256
}

fn default_inheritance_weight() -> f64 {
    0.5
}

fn default_mutation_bound() -> f64 {
    0.1
}

fn default_world_size() -> f64 {
    1000.0
}

fn default_max_speed() -> f64 {
    5.0
}

fn default_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("tools.d")]
}

fn default_max_files() -> usize {
    1000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/tool_config.json")
}

fn default_workers() -> usize {
    8
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            acceleration: default_acceleration(),
            max_acceleration: default_max_acceleration(),
            fixed_step: default_fixed_step(),
            tick_interval_ms: default_tick_interval_ms(),
            maturity_age: default_maturity_age(),
            reproduction_cooldown: default_reproduction_cooldown(),
            compatibility_threshold: default_compatibility_threshold(),
            mating_radius: default_mating_radius(),
            max_population: default_max_population(),
            inheritance_weight: default_inheritance_weight(),
            mutation_bound: default_mutation_bound(),
            world_width: default_world_size(),
            world_height: default_world_size(),
            max_speed: default_max_speed(),
            seed: None,
            initial_agents: 0,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            max_files: default_max_files(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            attempts: default_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            endpoint: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            in_memory: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            listen: None,
        }
    }
}

impl BridgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// File (or defaults), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TOOLWORLD_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("ACCELERATION") {
            self.simulation.acceleration = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = get("SEED") {
            self.simulation.seed = Some(parse_env(&key, &value)?);
        }
        if let Some((_, value)) = get("DISCOVERY_ROOTS") {
            self.discovery.roots = std::env::split_paths(&value).collect();
        }
        if let Some((_, value)) = get("BRIDGE_ENDPOINT") {
            self.bridge.endpoint = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some((key, value)) = get("REQUEST_TIMEOUT_MS") {
            self.bridge.timeout_ms = parse_env(&key, &value)?;
        }
        if let Some((_, value)) = get("STORE_PATH") {
            self.store.path = PathBuf::from(value);
        }
        if let Some((key, value)) = get("WORKERS") {
            self.server.workers = parse_env(&key, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sim = &self.simulation;
        let positive = [
            ("simulation.acceleration", sim.acceleration),
            ("simulation.max_acceleration", sim.max_acceleration),
            ("simulation.fixed_step", sim.fixed_step),
            ("simulation.world_width", sim.world_width),
            ("simulation.world_height", sim.world_height),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if !(0.0..=1.0).contains(&sim.compatibility_threshold) {
            return Err(ConfigError::Invalid(
                "simulation.compatibility_threshold must be within [0, 1]".into(),
            ));
        }
        if self.bridge.attempts == 0 {
            return Err(ConfigError::Invalid("bridge.attempts must be at least 1".into()));
        }
        if self.bridge.timeout_ms == 0 {
            return Err(ConfigError::Invalid("bridge.timeout_ms must be positive".into()));
        }
        if self.server.workers == 0 {
            return Err(ConfigError::Invalid("server.workers must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}
