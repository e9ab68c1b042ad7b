//! Discovery configuration management

use crate::error::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by the aggregator and every registrant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Coordination store endpoints, tried in order
    #[serde(alias = "etcd_nodes")]
    pub store_nodes: Vec<String>,

    /// Per-request deadline for store calls, in seconds
    #[serde(alias = "etcd_header_timeout")]
    pub header_timeout: u64,

    /// TTL applied to a worker key, in seconds
    #[serde(alias = "etcd_worker_timeout")]
    pub lease_timeout: u64,

    /// Lease renewal period, in seconds
    #[serde(alias = "etcd_worker_heartbeat")]
    pub heartbeat_interval: u64,

    /// Key prefix under which worker keys are written
    #[serde(alias = "etcd_worker_dir")]
    pub worker_namespace: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            store_nodes: vec!["http://127.0.0.1:2379".to_string()],
            header_timeout: 3,
            lease_timeout: 100,
            heartbeat_interval: 30,
            worker_namespace: "/etcDiscovery/".to_string(),
        }
    }
}

impl DiscoveryConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiscoveryError::configuration(format!("Failed to read config file: {}", e))
        })?;

        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        std::fs::write(path, content).map_err(|e| {
            DiscoveryError::configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.store_nodes.is_empty() {
            return Err(DiscoveryError::configuration(
                "At least one store node must be configured",
            ));
        }

        if let Some(node) = self
            .store_nodes
            .iter()
            .find(|node| !node.starts_with("http://") && !node.starts_with("https://"))
        {
            return Err(DiscoveryError::configuration(format!(
                "Store node '{}' must be an http:// or https:// URL",
                node
            )));
        }

        if self.header_timeout == 0 {
            return Err(DiscoveryError::configuration(
                "Header timeout must be at least 1 second",
            ));
        }

        if self.heartbeat_interval == 0 {
            return Err(DiscoveryError::configuration(
                "Heartbeat interval must be at least 1 second",
            ));
        }

        if self.heartbeat_interval >= self.lease_timeout {
            return Err(DiscoveryError::configuration(format!(
                "Heartbeat interval ({}s) must be shorter than lease timeout ({}s)",
                self.heartbeat_interval, self.lease_timeout
            )));
        }

        if !self.worker_namespace.starts_with('/') || !self.worker_namespace.ends_with('/') {
            return Err(DiscoveryError::configuration(
                "Worker namespace must start and end with '/'",
            ));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_timeout)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// Store key under which the named worker registers
    pub fn worker_key(&self, name: &str) -> String {
        format!("{}{}", self.worker_namespace, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.store_nodes, vec!["http://127.0.0.1:2379"]);
        assert_eq!(config.worker_namespace, "/etcDiscovery/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DiscoveryConfig::default();

        config.store_nodes.clear();
        assert!(config.validate().is_err());

        config.store_nodes = vec!["127.0.0.1:2379".to_string()];
        assert!(config.validate().is_err());

        config.store_nodes = vec!["https://10.0.0.5:2379".to_string()];
        assert!(config.validate().is_ok());

        // Lease must outlive the heartbeat
        config.heartbeat_interval = config.lease_timeout;
        assert!(config.validate().is_err());
        config.heartbeat_interval = 10;

        config.worker_namespace = "/workers".to_string();
        assert!(config.validate().is_err());
        config.worker_namespace = "workers/".to_string();
        assert!(config.validate().is_err());

        config.worker_namespace = "/workers/".to_string();
        config.header_timeout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_key() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.worker_key("client1"), "/etcDiscovery/client1");
    }

    #[test]
    fn test_durations() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.lease_ttl(), Duration::from_secs(100));
        assert_eq!(config.heartbeat_period(), Duration::from_secs(30));
    }

    #[test]
    fn test_legacy_key_names() {
        let content = r#"
            etcd_nodes = ["http://10.0.0.1:2379", "http://10.0.0.2:2379"]
            etcd_header_timeout = 5
            etcd_worker_timeout = 20
            etcd_worker_heartbeat = 5
            etcd_worker_dir = "/workers/"
        "#;

        let config: DiscoveryConfig = toml::from_str(content).unwrap();
        assert_eq!(config.store_nodes.len(), 2);
        assert_eq!(config.header_timeout, 5);
        assert_eq!(config.lease_timeout, 20);
        assert_eq!(config.heartbeat_interval, 5);
        assert_eq!(config.worker_namespace, "/workers/");
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("discovery.toml");

        let config = DiscoveryConfig {
            worker_namespace: "/services/api/".to_string(),
            ..Default::default()
        };

        config.to_file(&config_path).unwrap();
        assert!(config_path.exists());

        let loaded = DiscoveryConfig::from_file(&config_path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = tempdir().unwrap();
        let result = DiscoveryConfig::from_file(temp_dir.path().join("absent.toml"));
        assert!(matches!(result, Err(DiscoveryError::Configuration(_))));
    }
}
