use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Orchestrator connection settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Replica watcher settings
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Alert-driven scaling limits
    #[serde(default)]
    pub scaling: ScalingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Read timeout in seconds: bounds reading request headers and
    /// streaming the backend response body (default: 8)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Write timeout in seconds: bounds forwarding a request to a function
    /// until its response headers arrive (default: 8)
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Bearer token required on /system/* when set
    pub admin_token: Option<String>,

    /// Maximum idle connections per function backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Docker endpoint, e.g. unix:///var/run/docker.sock or tcp://host:2375.
    /// Falls back to DOCKER_HOST, then common socket paths.
    pub docker_host: Option<String>,

    /// Timeout for each orchestrator API call in seconds (default: 10)
    #[serde(default = "default_orchestrator_timeout")]
    pub timeout_secs: u64,

    /// Label marking a service as a function (default: "function")
    #[serde(default = "default_function_label")]
    pub function_label: String,

    /// Overlay network attached to new function services
    pub network: Option<String>,

    /// Port function containers listen on (default: 8080)
    #[serde(default = "default_function_port")]
    pub function_port: u16,
}

impl OrchestratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            timeout_secs: default_orchestrator_timeout(),
            function_label: default_function_label(),
            network: None,
            function_port: default_function_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    /// Seconds between replica polls (default: 5)
    #[serde(default = "default_watcher_interval")]
    pub interval_secs: u64,

    /// Age in seconds after which a cached route is re-resolved
    /// (default: twice the interval)
    pub freshness_secs: Option<u64>,
}

impl WatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(
            self.freshness_secs
                .unwrap_or_else(|| self.interval_secs.saturating_mul(2)),
        )
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watcher_interval(),
            freshness_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ScalingConfig {
    /// Replicas added per firing alert (default: 5)
    #[serde(default = "default_scale_step")]
    pub scale_step: u64,

    /// Upper bound for alert-driven scaling (default: 20)
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u64,

    /// Replica count restored when an alert resolves (default: 1)
    #[serde(default = "default_min_replicas")]
    pub min_replicas: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            scale_step: default_scale_step(),
            max_replicas: default_max_replicas(),
            min_replicas: default_min_replicas(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_read_timeout() -> u64 {
    8
}

fn default_write_timeout() -> u64 {
    8
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_orchestrator_timeout() -> u64 {
    10
}

fn default_function_label() -> String {
    "function".to_string()
}

fn default_function_port() -> u16 {
    8080
}

fn default_watcher_interval() -> u64 {
    5
}

fn default_scale_step() -> u64 {
    5
}

fn default_max_replicas() -> u64 {
    20
}

fn default_min_replicas() -> u64 {
    1
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.read_timeout_secs == 0 {
            errors.push("server.read_timeout_secs must be non-zero".to_string());
        }
        if self.server.write_timeout_secs == 0 {
            errors.push("server.write_timeout_secs must be non-zero".to_string());
        }
        if self.orchestrator.timeout_secs == 0 {
            errors.push("orchestrator.timeout_secs must be non-zero".to_string());
        }
        if self.orchestrator.function_label.is_empty() {
            errors.push("orchestrator.function_label must not be empty".to_string());
        }
        if self.watcher.interval_secs == 0 {
            errors.push("watcher.interval_secs must be non-zero".to_string());
        }
        if self.watcher.freshness() < self.watcher.interval() {
            errors.push(format!(
                "watcher.freshness_secs ({}) must be at least watcher.interval_secs ({})",
                self.watcher.freshness().as_secs(),
                self.watcher.interval_secs
            ));
        }
        if self.scaling.min_replicas > self.scaling.max_replicas {
            errors.push("scaling.min_replicas must not exceed scaling.max_replicas".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
