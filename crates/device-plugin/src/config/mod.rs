//! Device plugin configuration
//!
//! A [`DeviceConfig`] is assembled once at startup from an optional YAML file
//! overlaid with command line flags, then augmented with default resources by
//! [`crate::rm::add_default_resources_to_config`]. It is read-only afterwards.

pub mod cli;
pub mod resources;

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing::warn;

pub use cli::Cli;
pub use resources::Resource;
pub use resources::ResourceName;
pub use resources::Resources;

/// Errors raised while building the device configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid resource name: {name}")]
    InvalidResourceName { name: String },
    #[error("invalid resource pattern: {pattern}")]
    InvalidPattern { pattern: String },
    #[error("failed to initialize NVML")]
    SessionInitFailed,
    #[error("failed to enumerate MIG profiles")]
    ProfileEnumerationFailed,
    #[error("failed to read config file {}", path.display())]
    ReadFailed { path: PathBuf },
    #[error("failed to parse config file {}", path.display())]
    ParseFailed { path: PathBuf },
}

/// How MIG devices are exposed to the cluster.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum MigStrategy {
    /// MIG devices are not advertised; every GPU is exposed whole
    #[default]
    #[display("none")]
    None,
    /// All MIG devices share the whole-GPU resource name
    #[display("single")]
    Single,
    /// One resource per MIG profile, e.g. `nvidia.com/mig-1g.5gb`
    #[display("mixed")]
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Flags {
    pub mig_strategy: MigStrategy,
    /// Abort startup on platform detection or NVML initialization errors
    /// instead of running without resources
    pub fail_on_init_error: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            mig_strategy: MigStrategy::None,
            fail_on_init_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    /// Skip event subscription entirely
    pub disabled: bool,
    /// XIDs ignored in addition to the application-level defaults
    pub skipped_xids: Vec<u64>,
    /// Seconds between device re-enumerations while health checks run
    pub refresh_interval_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            skipped_xids: Vec::new(),
            refresh_interval_secs: 30,
        }
    }
}

impl HealthCheckConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    /// Apply a `DP_DISABLE_HEALTHCHECKS` style value.
    ///
    /// `all` and `xids` disable health checks; numbers are added to the
    /// skipped XIDs. Anything else is ignored with a warning.
    pub fn apply_disable_spec(&mut self, spec: &str) {
        for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "all" | "xids" => self.disabled = true,
                other => match other.parse::<u64>() {
                    Ok(xid) => self.skipped_xids.push(xid),
                    Err(_) => warn!(value = %token, "Ignoring unrecognized health check setting"),
                },
            }
        }
    }
}

/// Process-wide device plugin configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    /// Resource whole GPUs are advertised as
    pub resource_name: ResourceName,
    pub flags: Flags,
    pub resources: Resources,
    pub health: HealthCheckConfig,
}

impl DeviceConfig {
    /// Parse a YAML configuration document.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::ParseFailed`] if the document is malformed
    /// - [`ConfigError::InvalidPattern`] if a resource pattern is not a valid glob
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self, Report<ConfigError>> {
        let config: Self = serde_yaml::from_str(content).change_context(ConfigError::ParseFailed {
            path: path.to_path_buf(),
        })?;
        config.resources.validate()?;
        Ok(config)
    }

    /// Overlay the values explicitly given on the command line.
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<(), Report<ConfigError>> {
        if let Some(name) = &cli.resource_name {
            self.resource_name = ResourceName::new(name)?;
        }
        if let Some(strategy) = cli.mig_strategy {
            self.flags.mig_strategy = strategy;
        }
        if let Some(fail_on_init_error) = cli.fail_on_init_error {
            self.flags.fail_on_init_error = fail_on_init_error;
        }
        if let Some(spec) = &cli.disable_health_checks {
            self.health.apply_disable_spec(spec);
        }
        if let Some(secs) = cli.health_refresh_interval_secs {
            self.health.refresh_interval_secs = secs;
        }
        Ok(())
    }
}

/// Build the configuration from the optional config file and the CLI flags.
///
/// # Errors
///
/// - [`ConfigError::ReadFailed`] if the config file cannot be read
/// - [`ConfigError::ParseFailed`] if the config file is malformed
/// - [`ConfigError::InvalidResourceName`] if `--resource-name` is invalid
pub async fn load_config(cli: &Cli) -> Result<DeviceConfig, Report<ConfigError>> {
    let mut config = match &cli.config_file {
        Some(path) => {
            info!("Loading device plugin configuration from {:?}", path);
            let content = tokio::fs::read_to_string(path)
                .await
                .change_context(ConfigError::ReadFailed { path: path.clone() })?;
            DeviceConfig::from_yaml(&content, path)?
        }
        None => DeviceConfig::default(),
    };

    config.apply_cli(cli)?;

    info!(
        resource_name = %config.resource_name,
        mig_strategy = %config.flags.mig_strategy,
        fail_on_init_error = config.flags.fail_on_init_error,
        health_checks_disabled = config.health.disabled,
        "Device plugin configuration loaded"
    );
    Ok(config)
}
