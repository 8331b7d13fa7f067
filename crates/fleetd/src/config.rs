//! Daemon configuration

use anyhow::{Context, Result};
use fleet_core::config::FleetConfig;
use fleet_core::lifecycle::AgentSpec;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming an optional TOML config file
pub const CONFIG_FILE_ENV: &str = "FLEET_CONFIG";

/// Daemon configuration. Every field may be overridden by a `FLEET__`
/// environment variable, with `__` separating nested keys
/// (`FLEET__FLEET__MONITORING__INTERVAL_MS=2000`).
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Name used in structured log events
    #[serde(default = "default_node_name")]
    pub node_name: String,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// API server port for operations, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Start the monitoring loop as soon as the daemon is up
    #[serde(default = "default_monitor_on_start")]
    pub monitor_on_start: bool,

    /// Agent types registered at startup
    #[serde(default)]
    pub agent_types: Vec<AgentSpec>,

    #[serde(default)]
    pub fleet: FleetConfig,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_monitor_on_start() -> bool {
    true
}

impl DaemonConfig {
    /// Load from the file named by `FLEET_CONFIG`, if set, and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from `path` (TOML) plus environment overrides, then validate
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: DaemonConfig = builder
            .add_source(
                config::Environment::with_prefix("FLEET")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("failed to parse configuration")?;

        config.fleet.validate().context("invalid fleet configuration")?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.api_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let config = DaemonConfig::load_from(None).unwrap();
        assert_eq!(config.api_port, 8080);
        assert!(config.monitor_on_start);
        assert!(config.agent_types.is_empty());
        assert_eq!(config.fleet, FleetConfig::default());
    }

    #[test]
    fn test_file_overrides_nested_sections() {
        let file = write_config(
            r#"
api_port = 9100
monitor_on_start = false

[fleet.monitoring]
interval_ms = 2000

[fleet.optimization]
strategy = "conservative"

[[agent_types]]
type = "indexer"
requirements = { cpu = 100 }
"#,
        );
        let config = DaemonConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.api_port, 9100);
        assert!(!config.monitor_on_start);
        assert_eq!(config.fleet.monitoring.interval_ms, 2_000);
        assert_eq!(
            config.fleet.monitoring.retention,
            FleetConfig::default().monitoring.retention
        );
        assert_eq!(config.agent_types.len(), 1);
        assert_eq!(config.agent_types[0].agent_type, "indexer");
        assert_eq!(config.agent_types[0].requirements.cpu, 100);
    }

    #[test]
    fn test_invalid_fleet_config_rejected() {
        let file = write_config(
            r#"
[fleet.monitoring]
interval_ms = 10
"#,
        );
        let err = DaemonConfig::load_from(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("interval_ms"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(DaemonConfig::load_from(Some(Path::new("/nonexistent/fleet.toml"))).is_err());
    }
}
