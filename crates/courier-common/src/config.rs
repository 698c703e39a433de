//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Process configuration loading and validation."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_app_id() -> String {
    "courier".to_owned()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_inbound_capacity() -> usize {
    1024
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn enabled() -> bool {
    true
}

/// Top-level configuration of a Courier process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub routers: RoutersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// A [`CourierConfig`] together with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: CourierConfig,
    pub source: PathBuf,
}

impl CourierConfig {
    pub const ENV_CONFIG_PATH: &str = "COURIER_CONFIG";

    /// Load configuration from disk, respecting the `COURIER_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load the first existing candidate, or the file named by
    /// `COURIER_CONFIG` when set, and report which file was used.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let source = PathBuf::from(env_path);
                let config = Self::from_path(&source)?;
                return Ok(LoadedConfig { config, source });
            }
        }

        let source = candidates
            .iter()
            .map(|candidate| candidate.as_ref())
            .find(|candidate| candidate.exists())
            .ok_or_else(|| {
                anyhow!(
                    "no configuration file found, looked in: {}",
                    candidates
                        .iter()
                        .map(|p| p.as_ref().display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })?
            .to_path_buf();
        let config = Self::from_path(&source)?;
        Ok(LoadedConfig { config, source })
    }

    /// Parse and validate one TOML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.app_id.trim().is_empty() {
            return Err(anyhow!("identity.app_id must not be empty"));
        }
        if self.broker.default_timeout.is_zero() {
            return Err(anyhow!("broker.default_timeout_ms must be greater than zero"));
        }
        if self.broker.inbound_capacity == 0 {
            return Err(anyhow!("broker.inbound_capacity must be greater than zero"));
        }
        self.routers.validate()
    }
}

impl std::str::FromStr for CourierConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: CourierConfig =
            toml::from_str(content).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Who this process is on the message fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// Generated at startup when absent.
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            instance_id: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Reply deadline for requests that do not set their own.
    #[serde(rename = "default_timeout_ms", default = "default_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_timeout: Duration,
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

/// Which routers to start and how to rank them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutersConfig {
    #[serde(default = "RouterToggle::in_process")]
    pub in_process: RouterToggle,
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default = "RouterToggle::queue")]
    pub queue: RouterToggle,
}

impl Default for RoutersConfig {
    fn default() -> Self {
        Self {
            in_process: RouterToggle::in_process(),
            pubsub: PubSubConfig::default(),
            queue: RouterToggle::queue(),
        }
    }
}

impl RoutersConfig {
    fn validate(&self) -> Result<()> {
        if !(self.in_process.enabled || self.pubsub.enabled || self.queue.enabled) {
            return Err(anyhow!("at least one router must be enabled"));
        }
        if let Some(blank) = self.pubsub.channels.iter().find(|c| c.trim().is_empty()) {
            return Err(anyhow!("routers.pubsub.channels contains a blank name ({blank:?})"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouterToggle {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

impl RouterToggle {
    fn in_process() -> Self {
        Self {
            enabled: true,
            priority: 100,
        }
    }

    fn queue() -> Self {
        Self {
            enabled: false,
            priority: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default = "PubSubConfig::default_priority")]
    pub priority: i32,
    /// Channels this process listens on.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl PubSubConfig {
    fn default_priority() -> i32 {
        50
    }
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: Self::default_priority(),
            channels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}
