use std::collections::BTreeMap;

use error_stack::Report;
use tracing::debug;

use super::device::Device;
use super::device::Devices;
use super::device::Health;
use super::ResourceManagerError;
use crate::config::DeviceConfig;
use crate::config::MigStrategy;
use crate::config::ResourceName;
use crate::platform::GpuDevice;
use crate::platform::MigDevice;

pub(crate) type DeviceMap = BTreeMap<ResourceName, Devices>;

fn gpu_device_node(gpu: &GpuDevice) -> String {
    format!("/dev/nvidia{}", gpu.minor_number)
}

fn whole_gpu(gpu: &GpuDevice) -> Device {
    Device {
        id: gpu.uuid.clone(),
        health: Health::Healthy,
        index: gpu.index.to_string(),
        paths: vec![gpu_device_node(gpu)],
        total_memory: gpu.total_memory,
        numa_node: gpu.numa_node,
        parent: None,
    }
}

fn mig_device(gpu: &GpuDevice, mig: &MigDevice) -> Device {
    Device {
        id: mig.uuid.clone(),
        health: Health::Healthy,
        index: format!("{}:{}", gpu.index, mig.index),
        paths: vec![gpu_device_node(gpu)],
        total_memory: mig.total_memory,
        numa_node: gpu.numa_node,
        parent: Some(gpu.uuid.clone()),
    }
}

/// Under the `single` strategy every GPU must agree on MIG mode and every MIG
/// device must share one profile.
fn validate_single_strategy(gpus: &[GpuDevice]) -> Result<(), Report<ResourceManagerError>> {
    let invalid = |message: &str| {
        Report::new(ResourceManagerError::InvalidMigConfiguration {
            message: message.to_string(),
        })
    };

    let enabled = gpus.iter().filter(|gpu| gpu.mig_enabled).count();
    if enabled == 0 {
        return Ok(());
    }
    if enabled != gpus.len() {
        return Err(invalid("all GPUs must have MIG enabled or none of them"));
    }

    let mut profiles = gpus
        .iter()
        .flat_map(|gpu| &gpu.mig_devices)
        .map(|mig| &mig.profile);
    let Some(first) = profiles.next() else {
        return Err(invalid("MIG is enabled but no MIG devices are configured"));
    };
    if let Some(other) = profiles.find(|profile| *profile != first) {
        return Err(invalid("all MIG devices must share one profile")
            .attach_printable(format!("found {first} and {other}")));
    }
    Ok(())
}

/// Group enumerated devices by the resource they are exposed as.
///
/// Whole GPUs are matched by product name against GPU rules, MIG devices by
/// profile against MIG rules. The first matching rule wins; unmatched devices
/// are not exposed. Resources without devices are left out.
pub(crate) fn build_device_map(
    config: &DeviceConfig,
    gpus: &[GpuDevice],
) -> Result<DeviceMap, Report<ResourceManagerError>> {
    let strategy = config.flags.mig_strategy;
    if strategy == MigStrategy::Single {
        validate_single_strategy(gpus)?;
    }

    let mut grouped: BTreeMap<ResourceName, Vec<Device>> = BTreeMap::new();
    for gpu in gpus {
        if strategy == MigStrategy::None || !gpu.mig_enabled {
            match config.resources.match_gpu(&gpu.name) {
                Some(resource) => grouped
                    .entry(resource.name.clone())
                    .or_default()
                    .push(whole_gpu(gpu)),
                None => debug!(gpu = %gpu.uuid, name = %gpu.name, "No resource matches GPU"),
            }
            continue;
        }

        for mig in &gpu.mig_devices {
            let profile = mig.profile.to_string();
            match config.resources.match_mig(&profile) {
                Some(resource) => grouped
                    .entry(resource.name.clone())
                    .or_default()
                    .push(mig_device(gpu, mig)),
                None => debug!(device = %mig.uuid, %profile, "No resource matches MIG device"),
            }
        }
    }

    Ok(grouped
        .into_iter()
        .map(|(name, devices)| (name, devices.into_iter().collect::<Devices>()))
        .filter(|(_, devices)| !devices.is_empty())
        .collect())
}
