//! Sidecar configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use meshbed_common::paths::CNI_BIN_DIR;
use meshbed_common::{MeshbedError, MeshbedPaths, MeshbedResult};
use meshbed_network::{ConfiguratorSettings, PluginSettings, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Retry knobs for CNI attach, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per attach.
    pub attempts: u32,
    /// Delay between attempts.
    pub backoff_secs: u64,
    /// Ceiling for the whole attach.
    pub deadline_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_secs: 2,
            deadline_secs: 30,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self::default()
            .with_attempts(cfg.attempts)
            .with_backoff(Duration::from_secs(cfg.backoff_secs))
            .with_deadline(Duration::from_secs(cfg.deadline_secs))
    }
}

/// Sidecar configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Name of the managed data network.
    pub data_network: String,
    /// Data interface name inside containers.
    pub interface_name: String,
    /// Pool for addresses when none is requested.
    pub subnet: Ipv4Net,
    /// Directories searched for CNI plugins.
    pub cni_bin_dirs: Vec<PathBuf>,
    /// Root of the host's proc filesystem.
    pub proc_root: PathBuf,
    /// Per-container event queue length.
    pub queue_depth: usize,
    /// CNI plugin settings.
    pub plugin: PluginSettings,
    /// Attach retry settings.
    pub retry: RetryConfig,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        let settings = ConfiguratorSettings::default();
        Self {
            data_network: settings.network,
            interface_name: settings.if_name,
            subnet: settings.subnet,
            cni_bin_dirs: vec![CNI_BIN_DIR.clone()],
            proc_root: PathBuf::from("/proc"),
            queue_depth: 16,
            plugin: PluginSettings::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl SidecarConfig {
    /// Parse from TOML.
    ///
    /// # Errors
    ///
    /// Returns [`MeshbedError::Config`] if the document is invalid.
    pub fn from_toml(content: &str) -> MeshbedResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| MeshbedError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> MeshbedResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| MeshbedError::Config {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml(&content)
    }

    /// Load from a file if it exists, otherwise use defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> MeshbedResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    fn validate(&self) -> MeshbedResult<()> {
        if self.data_network.is_empty() {
            return Err(MeshbedError::Config {
                message: "data_network must not be empty".to_string(),
            });
        }
        if self.interface_name.is_empty() || self.interface_name.len() > 15 {
            return Err(MeshbedError::Config {
                message: format!(
                    "interface_name '{}' must be 1 to 15 characters",
                    self.interface_name
                ),
            });
        }
        if self.queue_depth == 0 {
            return Err(MeshbedError::Config {
                message: "queue_depth must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Set the data network name.
    #[must_use]
    pub fn with_data_network(mut self, network: impl Into<String>) -> Self {
        self.data_network = network.into();
        self
    }

    /// Set the allocation subnet.
    #[must_use]
    pub fn with_subnet(mut self, subnet: Ipv4Net) -> Self {
        self.subnet = subnet;
        self
    }

    /// Set the plugin directories.
    #[must_use]
    pub fn with_cni_bin_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.cni_bin_dirs = dirs;
        self
    }

    /// Set the retry settings.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Configurator settings derived from this config.
    #[must_use]
    pub fn configurator_settings(&self) -> ConfiguratorSettings {
        ConfiguratorSettings::default()
            .with_network(&self.data_network)
            .with_if_name(&self.interface_name)
            .with_subnet(self.subnet)
    }

    /// Filesystem paths derived from this config.
    #[must_use]
    pub fn paths(&self) -> MeshbedPaths {
        MeshbedPaths {
            cni_bin_dirs: self.cni_bin_dirs.clone(),
            proc_root: self.proc_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SidecarConfig::default();
        assert_eq!(config.data_network, "default");
        assert_eq!(config.interface_name, "eth1");
        assert_eq!(config.subnet, "16.0.0.0/16".parse().unwrap());
        assert_eq!(RetryPolicy::from(config.retry), RetryPolicy::default());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SidecarConfig::from_toml(
            r#"
            subnet = "10.42.0.0/16"

            [plugin]
            plugin_type = "bridge"

            [retry]
            attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.subnet, "10.42.0.0/16".parse().unwrap());
        assert_eq!(config.plugin.plugin_type, "bridge");
        assert_eq!(config.plugin.cni_version, "0.3.0");
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.deadline_secs, 30);
        assert_eq!(config.interface_name, "eth1");
    }

    #[test]
    fn invalid_interface_name() {
        let err = SidecarConfig::from_toml(r#"interface_name = "much-too-long-name0""#).unwrap_err();
        assert!(err.to_string().contains("interface_name"));
    }

    #[test]
    fn builder_pattern() {
        let config = SidecarConfig::default()
            .with_data_network("data")
            .with_subnet("10.1.0.0/16".parse().unwrap())
            .with_retry(RetryConfig {
                attempts: 1,
                ..RetryConfig::default()
            });

        let settings = config.configurator_settings();
        assert_eq!(settings.network, "data");
        assert_eq!(settings.subnet, "10.1.0.0/16".parse().unwrap());
        assert_eq!(RetryPolicy::from(config.retry).attempts, 1);
    }
}
