use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::allocate;
use super::device::Device;
use super::device::Devices;
use super::device::Health;
use super::health;
use super::ResourceManager;
use super::ResourceManagerError;
use crate::config::DeviceConfig;
use crate::config::ResourceName;
use crate::platform::PlatformInfo;

/// Build one [`TegraResourceManager`] per resource with at least one device.
pub(crate) fn new_tegra_resource_managers(
    platform: &dyn PlatformInfo,
    config: &DeviceConfig,
) -> Result<Vec<Arc<dyn ResourceManager>>, Report<ResourceManagerError>> {
    let tegra_devices = platform
        .tegra_devices()
        .change_context(ResourceManagerError::DeviceEnumerationFailed)?;

    let mut grouped: BTreeMap<ResourceName, Vec<Device>> = BTreeMap::new();
    for (index, tegra) in tegra_devices.iter().enumerate() {
        let Some(resource) = config.resources.match_gpu(&tegra.name) else {
            debug!(name = %tegra.name, "No resource matches Tegra device");
            continue;
        };
        grouped.entry(resource.name.clone()).or_default().push(Device {
            id: index.to_string(),
            health: Health::Healthy,
            index: index.to_string(),
            paths: tegra.paths.clone(),
            total_memory: 0,
            numa_node: None,
            parent: None,
        });
    }

    Ok(grouped
        .into_iter()
        .map(|(resource, devices)| {
            Arc::new(TegraResourceManager {
                resource,
                devices: devices.into_iter().collect(),
            }) as Arc<dyn ResourceManager>
        })
        .collect())
}

/// Resource manager for integrated Tegra GPUs. Devices are enumerated once
/// and never health checked.
#[derive(Debug)]
pub struct TegraResourceManager {
    resource: ResourceName,
    devices: Devices,
}

#[async_trait]
impl ResourceManager for TegraResourceManager {
    fn resource(&self) -> &ResourceName {
        &self.resource
    }

    fn devices(&self) -> Devices {
        self.devices.clone()
    }

    fn get_preferred_allocation(
        &self,
        available: &[String],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, Report<ResourceManagerError>> {
        allocate::pass_through(available, required, size)
    }

    async fn check_health(
        &self,
        stop: CancellationToken,
        _unhealthy: mpsc::Sender<Device>,
        disable_health_checks: mpsc::Receiver<bool>,
        ack_disable_health_checks: mpsc::Sender<bool>,
    ) -> Result<(), Report<ResourceManagerError>> {
        info!(resource = %self.resource, "Health checks are not supported on Tegra devices");
        health::idle(&stop, disable_health_checks, &ack_disable_health_checks).await
    }
}
