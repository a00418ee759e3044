use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::warn;

use crate::config::ConfigError;
use crate::config::DeviceConfig;
use crate::config::MigStrategy;
use crate::platform::DeviceLib;
use crate::platform::NvmlSession;
use crate::platform::PlatformInfo;

/// Append the default matching rules to `config.resources`.
///
/// Every GPU falls back to `config.resource_name`. Under the `single`
/// strategy every MIG device is exposed as `gpu`; under `mixed` each MIG
/// profile gets its own `mig-<profile>` resource.
///
/// # Errors
///
/// - [`ConfigError::SessionInitFailed`] if NVML cannot be initialized under
///   the `mixed` strategy and `fail_on_init_error` is set
/// - [`ConfigError::ProfileEnumerationFailed`] if MIG profiles cannot be listed
pub fn add_default_resources_to_config(
    config: &mut DeviceConfig,
    platform: &dyn PlatformInfo,
    nvml: &Arc<dyn DeviceLib>,
) -> Result<(), Report<ConfigError>> {
    let resource_name = config.resource_name.to_string();
    config.resources.add_gpu_resource("*", &resource_name)?;

    match config.flags.mig_strategy {
        MigStrategy::None => Ok(()),
        MigStrategy::Single => config.resources.add_mig_resource("*", "gpu"),
        MigStrategy::Mixed => {
            let (has_nvml, reason) = platform.has_nvml();
            if !has_nvml {
                warn!("mig-strategy=\"{}\" is only supported with NVML", MigStrategy::Mixed);
                warn!("NVML not detected: {reason}");
                return Ok(());
            }

            let session = match NvmlSession::open(nvml.clone()) {
                Ok(session) => session,
                Err(e) if config.flags.fail_on_init_error => {
                    return Err(e.change_context(ConfigError::SessionInitFailed));
                }
                Err(e) => {
                    warn!("Failed to initialize NVML, skipping MIG resources: {e:?}");
                    return Ok(());
                }
            };

            let profiles = session
                .lib()
                .mig_profiles()
                .change_context(ConfigError::ProfileEnumerationFailed)?;
            for profile in profiles.iter().filter(|p| p.c == p.g) {
                let profile = profile.to_string();
                let name = format!("mig-{profile}").replace('+', ".");
                config
                    .resources
                    .add_mig_resource(&profile, &name)
                    .change_context(ConfigError::ProfileEnumerationFailed)?;
            }
            Ok(())
        }
    }
}
