//! Platform capability providers
//!
//! [`PlatformInfo`] answers which accelerator stack the host carries and lists
//! integrated Tegra GPUs. [`DeviceLib`] wraps the NVML management library:
//! session lifetime, GPU and MIG enumeration, and the critical event stream
//! the health checks consume.

pub mod host;
#[cfg(test)]
pub mod mock;
pub mod nvml;
mod raw;
pub mod session;

use core::error::Error;
use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Debug;

use async_trait::async_trait;
use derive_more::Display;
use error_stack::Report;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use host::HostPlatform;
pub use nvml::NvmlDeviceLib;
pub use session::NvmlSession;

/// Shared object probed for and loaded to reach NVML.
pub const NVML_LIBRARY: &str = "libnvidia-ml.so.1";

/// Capacity of the channel carrying [`HealthEvent`]s out of the blocking watcher.
pub const HEALTH_EVENT_BUFFER: usize = 64;

#[derive(Debug, Display)]
pub enum PlatformError {
    #[display("NVML library is not available")]
    NvmlUnavailable,
    #[display("NVML session is not initialized")]
    NotInitialized,
    #[display("NVML call failed: {operation}")]
    Nvml { operation: String },
    #[display("failed to read {path}")]
    Sysfs { path: String },
}

impl Error for PlatformError {}

/// Host level platform predicates. Each predicate returns a human readable
/// justification alongside its answer.
pub trait PlatformInfo: Send + Sync + Debug {
    fn has_nvml(&self) -> (bool, String);

    fn is_tegra_system(&self) -> (bool, String);

    /// Integrated GPUs of a Tegra host.
    fn tegra_devices(&self) -> Result<Vec<TegraDevice>, Report<PlatformError>>;
}

/// NVML backed device queries.
///
/// `init` and `shutdown` are reference counted: every successful `init` must
/// be paired with one `shutdown`. Prefer [`NvmlSession`] over calling them
/// directly.
#[async_trait]
pub trait DeviceLib: Send + Sync + Debug {
    fn init(&self) -> Result<(), Report<PlatformError>>;

    fn shutdown(&self) -> Result<(), Report<PlatformError>>;

    /// Physical GPUs in index order, with their MIG devices.
    fn gpus(&self) -> Result<Vec<GpuDevice>, Report<PlatformError>>;

    /// Every MIG profile supported by any GPU on the host.
    fn mig_profiles(&self) -> Result<BTreeSet<MigProfile>, Report<PlatformError>>;

    /// Start watching critical XID events on every GPU.
    ///
    /// Resolves once the watcher is registered. The stream ends when `stop`
    /// fires, when the receiver is dropped or when the watcher fails.
    async fn subscribe_health_events(
        &self,
        stop: CancellationToken,
    ) -> Result<mpsc::Receiver<HealthEvent>, Report<PlatformError>>;
}

/// An integrated GPU found on a Tegra host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TegraDevice {
    pub name: String,
    pub paths: Vec<String>,
}

/// A physical GPU as enumerated through NVML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub index: u32,
    pub uuid: String,
    /// Product name, e.g. `NVIDIA A100-SXM4-40GB`
    pub name: String,
    pub minor_number: u32,
    /// Bytes
    pub total_memory: u64,
    pub numa_node: Option<u32>,
    pub mig_enabled: bool,
    pub mig_devices: Vec<MigDevice>,
}

/// A MIG device carved out of a [`GpuDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigDevice {
    pub index: u32,
    pub uuid: String,
    pub profile: MigProfile,
    /// Bytes
    pub total_memory: u64,
}

/// A MIG partition shape: `c` compute slices on a `g` slice GPU instance with
/// `gb` gigabytes of memory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigProfile {
    pub c: u32,
    pub g: u32,
    pub gb: u64,
    pub attributes: Vec<String>,
}

impl MigProfile {
    pub fn new(c: u32, g: u32, gb: u64) -> Self {
        Self {
            c,
            g,
            gb,
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: &str) -> Self {
        self.attributes.push(attribute.to_string());
        self
    }
}

impl fmt::Display for MigProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.c == self.g {
            write!(f, "{}g.{}gb", self.g, self.gb)?;
        } else {
            write!(f, "{}c.{}g.{}gb", self.c, self.g, self.gb)?;
        }
        for attribute in &self.attributes {
            write!(f, "+{attribute}")?;
        }
        Ok(())
    }
}

/// An event observed on the NVML critical event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// A critical XID error. `device_uuid` is `None` when the event could not
    /// be attributed to a device, `xid` is `None` when NVML did not report the
    /// error code. Either way the event counts as critical.
    Xid {
        device_uuid: Option<String>,
        xid: Option<u64>,
    },
    /// A transient failure while waiting for events.
    Error { message: String },
}

/// Memory of a MIG partition in whole gigabytes, rounded the way NVIDIA names
/// its profiles (`1g.5gb` on a 40 GB A100 although the slice holds 4864 MiB).
pub fn mig_memory_size_gb(total_memory: u64, mig_memory_mb: u64) -> u64 {
    const FRACTION_DENOMINATOR: f64 = 8.0;
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    if total_memory == 0 {
        return 0;
    }
    let fraction = (mig_memory_mb * MIB) as f64 / total_memory as f64;
    let fraction = (fraction * FRACTION_DENOMINATOR).ceil() / FRACTION_DENOMINATOR;
    let total_gb = total_memory.div_ceil(GIB) as f64;
    (fraction * total_gb).round() as u64
}
