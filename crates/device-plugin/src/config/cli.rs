use std::path::PathBuf;

use clap::Parser;
use utils::version;

use super::MigStrategy;

/// Command line flags. Every value is optional and, when given, overrides the
/// corresponding entry of the config file.
#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "CONFIG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to a YAML device plugin config file, e.g. /etc/device-plugin/config.yaml"
    )]
    pub config_file: Option<PathBuf>,

    #[arg(
        long,
        env = "RESOURCE_NAME",
        help = "Resource name whole GPUs are advertised as, defaults to nvidia.com/gpu"
    )]
    pub resource_name: Option<String>,

    #[arg(
        long,
        env = "MIG_STRATEGY",
        value_enum,
        help = "Strategy for exposing MIG devices: none, single or mixed"
    )]
    pub mig_strategy: Option<MigStrategy>,

    #[arg(
        long,
        env = "FAIL_ON_INIT_ERROR",
        help = "Fail startup on platform detection or NVML initialization errors",
        action = clap::ArgAction::Set
    )]
    pub fail_on_init_error: Option<bool>,

    #[arg(
        long,
        env = "DP_DISABLE_HEALTHCHECKS",
        help = "Disable health checks with 'all' or 'xids', or skip a comma separated list of XIDs"
    )]
    pub disable_health_checks: Option<String>,

    #[arg(
        long,
        env = "HEALTH_REFRESH_INTERVAL_SECS",
        help = "Seconds between device re-enumerations while health checking"
    )]
    pub health_refresh_interval_secs: Option<u64>,
}
