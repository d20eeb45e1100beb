//! Configuration management for the hostfleet daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hostfleet_common::LogFormat;
use hostfleet_pool::PoolConfig;

use crate::cli::Args;
use crate::registry::{HostRegistry, DEFAULT_IMAGE_POOL_PATH};

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostfleet/hostfleet.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Connection pool timing
    pub pool: PoolSettings,
    /// Host registry location
    pub registry: RegistryConfig,
    /// Hypervisor backend configuration
    pub hypervisor: HypervisorConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).with_context(|| "Failed to parse config file")
    }

    /// Effective configuration for `args`: the `--config` file, else
    /// [`DEFAULT_CONFIG_PATH`] when it loads, else defaults. CLI overrides
    /// are applied last.
    pub fn resolve(args: &Args) -> Result<(Self, ConfigSource)> {
        let (config, source) = match &args.config {
            Some(path) => (Self::load(path)?, ConfigSource::File(path.clone())),
            None => match Self::load(DEFAULT_CONFIG_PATH) {
                Ok(config) => (config, ConfigSource::File(DEFAULT_CONFIG_PATH.to_string())),
                Err(_) => (Self::default(), ConfigSource::Defaults),
            },
        };
        Ok((config.with_cli_overrides(args), source))
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(ref path) = args.registry_path {
            self.registry.path = Some(path.clone());
        }

        if let Some(ref uri) = args.libvirt_uri {
            self.hypervisor.default_uri = uri.clone();
        }

        if let Some(format) = args.log_format {
            self.logging.format = format;
        }

        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }

        self
    }
}

/// Where [`Config::resolve`] found the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(String),
    Defaults,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the REST API
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8090".to_string(),
        }
    }
}

/// Connection pool timing, in seconds. Zero means "use the default".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_idle_secs: u64,
    pub health_check_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig::new(
            Duration::from_secs(self.max_idle_secs),
            Duration::from_secs(self.health_check_interval_secs),
        )
        .with_cleanup_interval(Duration::from_secs(self.cleanup_interval_secs))
    }
}

/// Host registry configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry file (defaults to `~/.hostfleet/servers.json`)
    pub path: Option<PathBuf>,
}

impl RegistryConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(HostRegistry::default_path)
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// URI seeded into an empty registry on first start
    pub default_uri: String,
    /// ISO storage pool for the seeded host
    pub iso_pool: String,
    /// Template storage pool for the seeded host
    pub template_pool: String,
    /// Managed image path for the seeded host
    pub image_pool_path: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::Mock,
            default_uri: "qemu:///system".to_string(),
            iso_pool: "isos".to_string(),
            template_pool: "templates".to_string(),
            image_pool_path: DEFAULT_IMAGE_POOL_PATH.to_string(),
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// In-memory hosts for development and testing
    #[default]
    Mock,
    /// Libvirt/QEMU backend
    Libvirt,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(deserialize_with = "deserialize_log_format")]
    pub format: LogFormat,
}

fn deserialize_log_format<'de, D>(deserializer: D) -> std::result::Result<LogFormat, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}
