/// Configuration management for portero
use crate::balance::Algorithm;
use crate::controller::ControllerSettings;
use crate::core::{ClusterSettings, NodeSpec};
use crate::error::ConfigError;
use crate::health::{HealthCheck, HttpProbe};
use crate::session::{SessionSettings, DEFAULT_COOKIE_NAME, DEFAULT_MAX_ENTRIES};
use crate::utils::resolve_socket_addr;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Main portero configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Background service configuration
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Backend clusters
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Delay between connection cleaner sweeps in milliseconds
    pub cleaner_interval_ms: u64,
    /// Delay between session table sweeps in seconds
    pub session_sweep_interval_sec: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cleaner_interval_ms: 1000,
            session_sweep_interval_sec: 30,
        }
    }
}

impl ControllerConfig {
    pub fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            cleaner_interval: Duration::from_millis(self.cleaner_interval_ms),
            session_sweep_interval: Duration::from_secs(self.session_sweep_interval_sec),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl ClusterConfig {
    pub fn settings(&self) -> ClusterSettings {
        ClusterSettings {
            algorithm: self.algorithm,
            session: SessionSettings {
                ttl: Duration::from_secs(self.session.ttl_sec),
                max_entries: self.session.max_entries,
                cookie_name: self.session.cookie_name.clone(),
            },
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            idle_timeout: Duration::from_secs(self.connection.idle_timeout_sec),
        }
    }
}

/// Session persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session entry lifetime after its last write, in seconds
    pub ttl_sec: u64,
    /// Maximum number of pinned clients
    pub max_entries: usize,
    /// Cookie used by the sticky session strategy
    pub cookie_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_sec: 300,
            max_entries: DEFAULT_MAX_ENTRIES,
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
        }
    }
}

/// Backend connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub idle_timeout_sec: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            idle_timeout_sec: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node id; defaults to `addr`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Backend address, `host:port`
    pub addr: String,
    /// Concurrent connection limit, negative for unbounded
    #[serde(default = "unbounded")]
    pub max_connections: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
}

fn unbounded() -> i64 {
    -1
}

impl NodeConfig {
    pub fn new<S: Into<String>>(addr: S) -> Self {
        Self {
            id: None,
            addr: addr.into(),
            max_connections: unbounded(),
            health_check: None,
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.addr)
    }

    pub fn to_spec(&self) -> Result<NodeSpec, ConfigError> {
        let addr = resolve_socket_addr(&self.addr).map_err(|e| {
            ConfigError::ValidationError(format!("Invalid node address {}: {}", self.addr, e))
        })?;

        let mut spec = NodeSpec::new(self.id(), addr).with_max_connections(self.max_connections);
        if let Some(health_check) = &self.health_check {
            spec = spec.with_health_check(health_check.to_health_check()?);
        }
        Ok(spec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    Tcp,
    Udp,
    Http,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub protocol: ProbeProtocol,
    /// Delay between probes in milliseconds
    pub interval_ms: u64,
    /// Probe timeout in milliseconds
    pub timeout_ms: u64,
    /// Rolling window size
    pub samples: usize,
    /// Consecutive passes before marking healthy
    pub rise: usize,
    /// Consecutive failures before marking unhealthy
    pub fall: usize,
    /// Request path for HTTP probes
    pub uri: String,
    /// Probe over HTTPS
    pub tls: bool,
    /// Verify the backend certificate
    pub validate_tls: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            protocol: ProbeProtocol::Tcp,
            interval_ms: 5000,
            timeout_ms: 2000,
            samples: 100,
            rise: 3,
            fall: 3,
            uri: "/".to_string(),
            tls: false,
            validate_tls: true,
        }
    }
}

impl HealthCheckConfig {
    pub fn to_health_check(&self) -> Result<HealthCheck, ConfigError> {
        let check = match self.protocol {
            ProbeProtocol::Tcp => HealthCheck::tcp(),
            ProbeProtocol::Udp => HealthCheck::udp(),
            ProbeProtocol::Http => {
                let probe = HttpProbe::new(self.uri.clone(), self.tls, self.validate_tls)
                    .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
                HealthCheck::new(Arc::new(probe))
            }
        };

        Ok(check
            .with_interval(Duration::from_millis(self.interval_ms))
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_thresholds(self.samples, self.rise, self.fall))
    }

    fn validate(&self, node: &str) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Node {}: health check interval_ms must be greater than 0",
                node
            )));
        }

        if self.timeout_ms == 0 || self.timeout_ms > self.interval_ms {
            return Err(ConfigError::ValidationError(format!(
                "Node {}: health check timeout_ms must be between 1 and interval_ms",
                node
            )));
        }

        if self.samples == 0 || self.rise == 0 || self.fall == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Node {}: samples, rise and fall must be greater than 0",
                node
            )));
        }

        if self.protocol == ProbeProtocol::Http && !self.uri.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "Node {}: HTTP health check uri must start with '/'",
                node
            )));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller.cleaner_interval_ms == 0 || self.controller.session_sweep_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "controller intervals must be greater than 0".to_string(),
            ));
        }

        let mut cluster_names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "cluster name cannot be empty".to_string(),
                ));
            }
            if !cluster_names.insert(cluster.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate cluster name: {}",
                    cluster.name
                )));
            }
            cluster.validate()?;
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|cluster| cluster.name == name)
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(
        path: P,
        algorithm: Algorithm,
    ) -> Result<(), ConfigError> {
        let health_check = HealthCheckConfig {
            protocol: ProbeProtocol::Http,
            uri: "/health".to_string(),
            ..Default::default()
        };
        let nodes = ["10.0.1.10:8080", "10.0.1.11:8080", "10.0.1.12:8080"]
            .iter()
            .enumerate()
            .map(|(i, addr)| NodeConfig {
                id: Some(format!("web-{}", i + 1)),
                max_connections: 1024,
                health_check: Some(health_check.clone()),
                ..NodeConfig::new(*addr)
            })
            .collect();

        let config = Config {
            clusters: vec![ClusterConfig {
                name: "web".to_string(),
                algorithm,
                session: SessionConfig::default(),
                connection: ConnectionConfig::default(),
                nodes,
            }],
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

impl ClusterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.connect_timeout_ms == 0 || self.connection.idle_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Cluster {}: connection timeouts must be greater than 0",
                self.name
            )));
        }

        if self.session.ttl_sec == 0 || self.session.max_entries == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Cluster {}: session ttl_sec and max_entries must be greater than 0",
                self.name
            )));
        }

        let cookie = &self.session.cookie_name;
        if cookie.is_empty()
            || cookie
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ';' | '=' | ','))
        {
            return Err(ConfigError::ValidationError(format!(
                "Cluster {}: invalid cookie name: {:?}",
                self.name, cookie
            )));
        }

        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.id()) {
                return Err(ConfigError::ValidationError(format!(
                    "Cluster {}: duplicate node id: {}",
                    self.name,
                    node.id()
                )));
            }

            resolve_socket_addr(&node.addr).map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Cluster {}: invalid node address: {}",
                    self.name, node.addr
                ))
            })?;

            if node.max_connections == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Cluster {}: node {} max_connections cannot be 0",
                    self.name,
                    node.id()
                )));
            }

            if let Some(health_check) = &node.health_check {
                health_check.validate(node.id())?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample() -> Config {
        toml::from_str(
            r#"
            [logging]
            level = "debug"

            [[clusters]]
            name = "web"
            algorithm = "source_ip_hash"

            [[clusters.nodes]]
            addr = "127.0.0.1:8080"

            [[clusters.nodes]]
            id = "b"
            addr = "127.0.0.1:8081"
            max_connections = 16

            [clusters.nodes.health_check]
            protocol = "udp"
            interval_ms = 500
            timeout_ms = 100
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.clusters.is_empty());
    }

    #[test]
    fn test_parse_with_defaults() {
        let config = sample();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.format, "text");

        let cluster = config.cluster("web").unwrap();
        assert_eq!(cluster.algorithm, Algorithm::SourceIpHash);
        assert_eq!(cluster.session.ttl_sec, 300);
        assert_eq!(cluster.nodes[0].id(), "127.0.0.1:8080");
        assert_eq!(cluster.nodes[0].max_connections, -1);

        let health_check = cluster.nodes[1].health_check.as_ref().unwrap();
        assert_eq!(health_check.protocol, ProbeProtocol::Udp);
        assert_eq!(health_check.samples, 100);
    }

    #[test]
    fn test_conversions() {
        let config = sample();
        let cluster = config.cluster("web").unwrap();

        let settings = cluster.settings();
        assert_eq!(settings.algorithm, Algorithm::SourceIpHash);
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert_eq!(settings.session.ttl, Duration::from_secs(300));

        let unbounded = cluster.nodes[0].to_spec().unwrap();
        assert_eq!(unbounded.max_connections, None);
        assert!(unbounded.health_check.is_none());

        let bounded = cluster.nodes[1].to_spec().unwrap();
        assert_eq!(bounded.id, "b");
        assert_eq!(bounded.max_connections, Some(16));
        let check = bounded.health_check.unwrap();
        assert_eq!(check.interval, Duration::from_millis(500));
        assert_eq!(check.probe.name(), "udp");

        let controller = config.controller.settings();
        assert_eq!(controller.cleaner_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_validation() {
        let mut config = sample();
        config.clusters[0].nodes[1].id = Some("127.0.0.1:8080".to_string());
        assert!(config.validate().is_err());

        let mut config = sample();
        config.clusters[0].nodes[0].max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.clusters[0].nodes[0].addr = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.clusters[0].session.cookie_name = "bad name".to_string();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.clusters.push(config.clusters[0].clone());
        assert!(config.validate().is_err());

        let mut config = sample();
        if let Some(check) = config.clusters[0].nodes[1].health_check.as_mut() {
            check.timeout_ms = 1000;
        }
        assert!(config.validate().is_err());

        let mut config = sample();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();
        Config::create_example_config(temp_file.path(), Algorithm::StickySession).unwrap();

        let loaded = Config::load_from_file(temp_file.path()).unwrap();
        let cluster = loaded.cluster("web").unwrap();
        assert_eq!(cluster.algorithm, Algorithm::StickySession);
        assert_eq!(cluster.nodes.len(), 3);
        assert_eq!(cluster.nodes[0].id(), "web-1");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load_from_file("/nonexistent/portero.toml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
