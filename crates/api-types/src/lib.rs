//! Shared API type definitions
//!
//! This crate contains the value types that cross the boundary between the
//! node-local device plugin and the cluster-wide scheduler: the registry view
//! of a single device and the well-known vendor and annotation identifiers.

use serde::Deserialize;
use serde::Serialize;

/// Vendor tag carried by every NVIDIA GPU in the scheduler registry.
pub const NVIDIA_GPU_DEVICE: &str = "NVIDIA";

/// Node annotation naming one GPU the node operator has taken out of scheduling.
///
/// The value is a single device identifier, not a list.
pub const GPU_NO_USE_UUID_ANNOTATION: &str = "nvidia.com/nouse-gpuuuid";

/// Scheduling-relevant facts about one device as seen by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Device identifier, unique within its node
    pub id: String,
    /// Device index on its node
    #[serde(default)]
    pub index: u32,
    /// Number of tasks that may share this device
    #[serde(default)]
    pub count: i32,
    /// Device memory share in MiB
    #[serde(default)]
    pub devmem: i32,
    /// Device core share in percent
    #[serde(default)]
    pub devcore: i32,
    /// Device model, e.g. "NVIDIA-Tesla T4"
    #[serde(default, rename = "type")]
    pub device_type: String,
    /// NUMA node the device is attached to
    #[serde(default)]
    pub numa: i32,
    #[serde(default)]
    pub health: bool,
    /// Vendor tag, e.g. [`NVIDIA_GPU_DEVICE`]
    #[serde(default)]
    pub device_vendor: String,
}

impl DeviceInfo {
    /// Whether this device belongs to `vendor`. An empty vendor never matches.
    pub fn is_vendor(&self, vendor: &str) -> bool {
        !vendor.is_empty() && self.device_vendor == vendor
    }
}
