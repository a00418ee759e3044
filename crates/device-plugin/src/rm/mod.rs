//! Resource managers
//!
//! A [`ResourceManager`] owns the devices exposed under one resource name and
//! answers the questions a device plugin asks about them: which devices exist,
//! which device nodes back them, which ones to prefer for an allocation and
//! which ones turned unhealthy.
//!
//! [`new_resource_managers`] detects the platform once and builds NVML or
//! Tegra backed managers accordingly.

mod allocate;
mod defaults;
pub mod device;
mod device_map;
mod health;
pub mod nvml;
pub mod tegra;

use core::error::Error;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use defaults::add_default_resources_to_config;
pub use device::Device;
pub use device::Devices;
pub use device::Health;
pub use nvml::NvmlResourceManager;
pub use tegra::TegraResourceManager;

use crate::config::DeviceConfig;
use crate::config::ResourceName;
use crate::platform::DeviceLib;
use crate::platform::PlatformInfo;

#[derive(Debug, Display)]
pub enum ResourceManagerError {
    #[display("platform detection failed")]
    PlatformDetectionFailed,
    #[display("failed to construct {platform} resource managers")]
    ConstructionFailed { platform: String },
    #[display("invalid MIG configuration: {message}")]
    InvalidMigConfiguration { message: String },
    #[display("allocation size {size} is smaller than the {required} required devices")]
    InvalidAllocationSize { size: usize, required: usize },
    #[display("failed to subscribe to health events")]
    HealthSubscriptionFailed,
    #[display("failed to enumerate devices")]
    DeviceEnumerationFailed,
}

impl Error for ResourceManagerError {}

/// Lists a set of devices and checks their health.
#[async_trait]
pub trait ResourceManager: Send + Sync + Debug {
    /// Name the devices are advertised under. Fixed for the manager's lifetime.
    fn resource(&self) -> &ResourceName;

    /// Snapshot of the managed devices.
    fn devices(&self) -> Devices;

    /// Device nodes backing `ids`, in request order. Unknown ids are skipped
    /// and each node is listed once.
    fn get_device_paths(&self, ids: &[String]) -> Vec<String> {
        let devices = self.devices();
        let mut paths: Vec<String> = Vec::new();
        for path in ids
            .iter()
            .filter_map(|id| devices.get(id))
            .flat_map(|device| &device.paths)
        {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }

    /// `required` followed by the devices this manager would pick from
    /// `available`, at most `size` in total.
    ///
    /// # Errors
    ///
    /// - [`ResourceManagerError::InvalidAllocationSize`] if `size` is smaller
    ///   than `required`
    fn get_preferred_allocation(
        &self,
        available: &[String],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, Report<ResourceManagerError>>;

    /// Watch device health until `stop` fires.
    ///
    /// Devices that turn unhealthy are sent on `unhealthy`. A `true` on
    /// `disable_health_checks` suspends watching and a `false` resumes it;
    /// each toggle is acknowledged on `ack_disable_health_checks` once it has
    /// taken effect.
    async fn check_health(
        &self,
        stop: CancellationToken,
        unhealthy: mpsc::Sender<Device>,
        disable_health_checks: mpsc::Receiver<bool>,
        ack_disable_health_checks: mpsc::Sender<bool>,
    ) -> Result<(), Report<ResourceManagerError>>;
}

fn log_with_reason((detected, reason): (bool, String), tag: &str) -> bool {
    if detected {
        info!("Detected {tag} platform: {reason}");
    } else {
        info!("Detected non-{tag} platform: {reason}");
    }
    detected
}

/// Build one resource manager per resource exposed on this host.
///
/// # Errors
///
/// - [`ResourceManagerError::PlatformDetectionFailed`] if neither NVML nor
///   Tegra is present and `fail_on_init_error` is set
/// - [`ResourceManagerError::ConstructionFailed`] if building the managers
///   of the detected platform fails
pub fn new_resource_managers(
    platform: &dyn PlatformInfo,
    nvml: Arc<dyn DeviceLib>,
    config: &DeviceConfig,
) -> Result<Vec<Arc<dyn ResourceManager>>, Report<ResourceManagerError>> {
    let has_nvml = log_with_reason(platform.has_nvml(), "NVML");
    let mut is_tegra = log_with_reason(platform.is_tegra_system(), "Tegra");

    if !has_nvml && !is_tegra {
        error!("Incompatible platform detected");
        error!("If this is a GPU node, did you configure the NVIDIA Container Toolkit?");
        error!("You can check the prerequisites at: https://github.com/NVIDIA/k8s-device-plugin#prerequisites");
        error!("You can learn how to set the runtime at: https://github.com/NVIDIA/k8s-device-plugin#quick-start");
        error!("If this is not a GPU node, you should set up a toleration or nodeSelector to only deploy this plugin on GPU nodes");
        if config.flags.fail_on_init_error {
            return Err(Report::new(ResourceManagerError::PlatformDetectionFailed));
        }
        return Ok(Vec::new());
    }

    // Integrated and discrete GPUs on one node are not supported together
    if has_nvml && is_tegra {
        warn!("Disabling Tegra-based resources on NVML system");
        is_tegra = false;
    }

    let mut managers = Vec::new();
    if has_nvml {
        managers.extend(
            nvml::new_nvml_resource_managers(nvml, config).change_context(
                ResourceManagerError::ConstructionFailed {
                    platform: "NVML".to_string(),
                },
            )?,
        );
    }
    if is_tegra {
        managers.extend(
            tegra::new_tegra_resource_managers(platform, config).change_context(
                ResourceManagerError::ConstructionFailed {
                    platform: "Tegra".to_string(),
                },
            )?,
        );
    }

    let mut seen = HashSet::new();
    if let Some(duplicate) = managers.iter().find(|rm| !seen.insert(rm.resource().clone())) {
        let kind = if has_nvml { "NVML" } else { "Tegra" };
        return Err(Report::new(ResourceManagerError::ConstructionFailed {
            platform: kind.to_string(),
        })
        .attach_printable(format!("duplicate resource {}", duplicate.resource())));
    }

    for manager in &managers {
        info!(
            resource = %manager.resource(),
            devices = manager.devices().len(),
            "Created resource manager"
        );
    }
    Ok(managers)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::platform::mock::gpu;
    use crate::platform::mock::MockDeviceLib;
    use crate::platform::mock::MockPlatform;

    fn config(fail_on_init_error: bool) -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.flags.fail_on_init_error = fail_on_init_error;
        config.resources.add_gpu_resource("*", "gpu").expect("valid rule");
        config
    }

    fn names(managers: &[Arc<dyn ResourceManager>]) -> Vec<String> {
        managers.iter().map(|rm| rm.resource().to_string()).collect()
    }

    #[test]
    fn no_platform_without_fail_fast_yields_nothing() {
        let managers = new_resource_managers(
            &MockPlatform::new(false, false),
            Arc::new(MockDeviceLib::default()),
            &config(false),
        )
        .expect("not fail-fast");
        assert!(managers.is_empty());
    }

    #[test]
    fn no_platform_with_fail_fast_fails() {
        let err = new_resource_managers(
            &MockPlatform::new(false, false),
            Arc::new(MockDeviceLib::default()),
            &config(true),
        )
        .expect_err("fail-fast");
        assert!(matches!(
            err.current_context(),
            ResourceManagerError::PlatformDetectionFailed
        ));
    }

    #[test]
    fn nvml_wins_over_tegra() {
        let platform = MockPlatform::new(true, true).with_tegra_device("tegra", &["/dev/nvmap"]);
        let lib = Arc::new(MockDeviceLib::with_gpus(vec![gpu(0, "Tesla T4", None)]));
        let managers = new_resource_managers(&platform, lib.clone(), &config(true)).expect("valid");

        assert_eq!(names(&managers), vec!["nvidia.com/gpu"]);
        assert_eq!(managers[0].devices().ids(), vec!["GPU-0"]);
        assert_eq!(lib.open_sessions(), 0);
    }

    #[test]
    fn tegra_only_host() {
        let platform = MockPlatform::new(false, true).with_tegra_device("tegra", &["/dev/nvmap"]);
        let managers = new_resource_managers(
            &platform,
            Arc::new(MockDeviceLib::default()),
            &config(true),
        )
        .expect("valid");

        assert_eq!(names(&managers), vec!["nvidia.com/gpu"]);
        assert_eq!(managers[0].devices().ids(), vec!["0"]);
    }

    #[test]
    fn nvml_construction_failure_is_wrapped() {
        let platform = MockPlatform::new(true, false);
        let lib = Arc::new(MockDeviceLib::default().with_init_failure());
        let err = new_resource_managers(&platform, lib, &config(true)).expect_err("init fails");
        assert!(matches!(
            err.current_context(),
            ResourceManagerError::ConstructionFailed { platform } if platform == "NVML"
        ));
    }

    #[test]
    fn device_paths_follow_request_order() {
        let platform = MockPlatform::new(true, false);
        let lib = Arc::new(MockDeviceLib::with_gpus(vec![
            gpu(0, "Tesla T4", None),
            gpu(1, "Tesla T4", None),
        ]));
        let managers = new_resource_managers(&platform, lib, &config(true)).expect("valid");

        let ids = ["GPU-1".to_string(), "GPU-9".to_string(), "GPU-0".to_string()];
        assert_eq!(
            managers[0].get_device_paths(&ids),
            vec!["/dev/nvidia1", "/dev/nvidia0"]
        );
    }
}
