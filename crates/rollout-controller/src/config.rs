//! Controller configuration

use anyhow::{Context, Result};
use rollout_lib::{units::parse_duration, DriverConfig, EngineConfig};
use serde::Deserialize;
use std::time::Duration;

/// Controller configuration
///
/// Read from `ROLLOUT_*` environment variables, optionally layered over the
/// file named by `ROLLOUT_CONFIG_FILE`.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Default divergence percentage that triggers a rollout
    #[serde(default = "default_diff_percent_trigger")]
    pub diff_percent_trigger: u32,

    /// Default cooldown between rollouts, as a duration string (`15m`)
    #[serde(default = "default_cooldown_period")]
    pub cooldown_period: String,

    /// Full relist period in seconds
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Server-side watch timeout in seconds
    #[serde(default = "default_watch_timeout")]
    pub watch_timeout_secs: u64,

    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    /// Watch a single namespace instead of the whole cluster
    #[serde(default)]
    pub namespace: Option<String>,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_diff_percent_trigger() -> u32 {
    10
}

fn default_cooldown_period() -> String {
    "15m".to_string()
}

fn default_resync_interval() -> u64 {
    30
}

fn default_watch_timeout() -> u64 {
    300
}

fn default_field_manager() -> String {
    "flux-client-side-apply".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl ControllerConfig {
    /// Load configuration from environment and config file
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("ROLLOUT_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("ROLLOUT").try_parsing(true))
            .build()?;

        Self::from_config(config)
    }

    fn from_config(config: config::Config) -> Result<Self> {
        let parsed: Self = config
            .try_deserialize()
            .context("invalid controller configuration")?;
        parsed.cooldown()?;
        Ok(parsed)
    }

    fn cooldown(&self) -> Result<Duration> {
        parse_duration(&self.cooldown_period)
            .with_context(|| format!("invalid cooldown_period '{}'", self.cooldown_period))
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            diff_percent_trigger: self.diff_percent_trigger,
            cooldown_period: self.cooldown()?,
            field_manager: self.field_manager.clone(),
        })
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            namespace: self.namespace.clone(),
            watch_timeout: Duration::from_secs(self.watch_timeout_secs),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            ..DriverConfig::default()
        }
    }
}
