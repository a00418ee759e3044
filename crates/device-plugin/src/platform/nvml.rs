use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::enums::event::XidError;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::error::NvmlErrorWithSource;
use nvml_wrapper::EventSet;
use nvml_wrapper::Nvml;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::mig_memory_size_gb;
use super::raw;
use super::raw::RawNvml;
use super::DeviceLib;
use super::GpuDevice;
use super::HealthEvent;
use super::MigDevice;
use super::MigProfile;
use super::PlatformError;
use super::HEALTH_EVENT_BUFFER;
use super::NVML_LIBRARY;

/// Milliseconds the blocking watcher waits for an event before it rechecks
/// cancellation.
const EVENT_WAIT_TIMEOUT_MS: u32 = 5000;

/// Compute instance slice counts a GPU instance can be split into.
const COMPUTE_SLICE_COUNTS: [u32; 7] = [1, 2, 3, 4, 6, 7, 8];

const MIB: u64 = 1024 * 1024;

#[derive(Default)]
struct SessionState {
    nvml: Option<Arc<Nvml>>,
    raw: Option<Arc<RawNvml>>,
    refs: usize,
}

/// [`DeviceLib`] backed by the host's NVML library.
pub struct NvmlDeviceLib {
    library: String,
    sysfs_root: PathBuf,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for NvmlDeviceLib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmlDeviceLib")
            .field("library", &self.library)
            .field("refs", &self.lock().refs)
            .finish()
    }
}

impl Default for NvmlDeviceLib {
    fn default() -> Self {
        Self::new(NVML_LIBRARY, "/sys")
    }
}

fn nvml_op(operation: &str) -> PlatformError {
    PlatformError::Nvml {
        operation: operation.to_string(),
    }
}

fn init_nvml(library: &str) -> Result<Nvml, Report<PlatformError>> {
    match Nvml::init() {
        Ok(nvml) => {
            info!("NVML initialized successfully");
            Ok(nvml)
        }
        Err(_) => {
            warn!("Standard NVML init failed, trying with explicit library path");
            let nvml = Nvml::builder()
                .lib_path(OsStr::new(library))
                .init()
                .change_context(PlatformError::NvmlUnavailable)?;
            info!("NVML initialized with explicit library path");
            Ok(nvml)
        }
    }
}

/// Turn an NVML bus id (`00000000:3B:00.0`) into the sysfs form
/// (`0000:3b:00.0`).
fn sysfs_bus_id(bus_id: &str) -> String {
    let bus_id = bus_id.trim().to_ascii_lowercase();
    match bus_id.split_once(':') {
        Some((domain, rest)) if domain.len() > 4 => match domain.get(domain.len() - 4..) {
            Some(domain) => format!("{domain}:{rest}"),
            None => bus_id.clone(),
        },
        _ => bus_id,
    }
}

fn xid_code(data: Option<XidError>) -> Option<u64> {
    match data {
        Some(XidError::Value(xid)) => Some(xid),
        Some(XidError::Unknown) | None => None,
    }
}

impl NvmlDeviceLib {
    /// `sysfs_root` is where NUMA affinity is read from, normally `/sys`.
    pub fn new(library: impl Into<String>, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            library: library.into(),
            sysfs_root: sysfs_root.into(),
            state: Mutex::new(SessionState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn nvml(&self) -> Result<Arc<Nvml>, Report<PlatformError>> {
        self.lock()
            .nvml
            .clone()
            .ok_or_else(|| Report::new(PlatformError::NotInitialized))
    }

    fn raw(&self) -> Option<Arc<RawNvml>> {
        self.lock().raw.clone()
    }

    /// NUMA node of the PCI device at `bus_id`. `None` when the platform
    /// reports no affinity or has no sysfs entry for it.
    fn numa_node(&self, bus_id: &str) -> Result<Option<u32>, Report<PlatformError>> {
        let path = self
            .sysfs_root
            .join("bus/pci/devices")
            .join(sysfs_bus_id(bus_id))
            .join("numa_node");
        let sysfs_error = || PlatformError::Sysfs {
            path: path.display().to_string(),
        };

        let value = match std::fs::read_to_string(&path) {
            Ok(value) => value,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Report::new(e).change_context(sysfs_error())),
        };
        let node = value
            .trim()
            .parse::<i64>()
            .change_context_lazy(sysfs_error)
            .attach_printable_lazy(|| format!("unexpected content {:?}", value.trim()))?;
        // -1 means the platform reports no affinity
        Ok(u32::try_from(node).ok())
    }

    fn mig_devices(
        raw: &RawNvml,
        index: u32,
        parent_memory: u64,
    ) -> Result<(bool, Vec<MigDevice>), Report<PlatformError>> {
        let handle = raw.device_by_index(index)?;
        if raw.mig_enabled(handle)? != Some(true) {
            return Ok((false, Vec::new()));
        }

        let mut devices = Vec::new();
        for (slot, mig) in raw.mig_devices(handle)? {
            let attributes = raw.attributes(mig)?;
            devices.push(MigDevice {
                index: slot,
                uuid: raw.uuid(mig)?,
                profile: MigProfile::new(
                    attributes.compute_instance_slice_count,
                    attributes.gpu_instance_slice_count,
                    mig_memory_size_gb(parent_memory, attributes.memory_size_mb),
                ),
                total_memory: attributes.memory_size_mb * MIB,
            });
        }
        Ok((true, devices))
    }
}

#[async_trait]
impl DeviceLib for NvmlDeviceLib {
    fn init(&self) -> Result<(), Report<PlatformError>> {
        let mut state = self.lock();
        if state.refs == 0 {
            let nvml = init_nvml(&self.library)?;
            state.raw = match RawNvml::load(&self.library) {
                Ok(raw) => Some(Arc::new(raw)),
                Err(e) => {
                    warn!("MIG queries unavailable: {e:?}");
                    None
                }
            };
            state.nvml = Some(Arc::new(nvml));
        }
        state.refs += 1;
        Ok(())
    }

    fn shutdown(&self) -> Result<(), Report<PlatformError>> {
        let mut state = self.lock();
        if state.refs == 0 {
            return Err(Report::new(PlatformError::NotInitialized));
        }
        state.refs -= 1;
        if state.refs > 0 {
            return Ok(());
        }

        state.raw = None;
        let Some(nvml) = state.nvml.take() else {
            return Ok(());
        };
        match Arc::try_unwrap(nvml) {
            Ok(nvml) => nvml.shutdown().change_context(nvml_op("shutdown")),
            // An event watcher still holds the library; NVML shuts down when it exits.
            Err(_) => {
                debug!("NVML still in use by an event watcher, deferring shutdown");
                Ok(())
            }
        }
    }

    fn gpus(&self) -> Result<Vec<GpuDevice>, Report<PlatformError>> {
        let nvml = self.nvml()?;
        let raw = self.raw();
        let count = nvml.device_count().change_context(nvml_op("device_count"))?;

        let mut gpus = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = nvml
                .device_by_index(index)
                .change_context(nvml_op("device_by_index"))
                .attach_printable_lazy(|| format!("index {index}"))?;
            let total_memory = device
                .memory_info()
                .change_context(nvml_op("memory_info"))?
                .total;
            let numa_node = match device.pci_info() {
                Ok(pci) => self.numa_node(&pci.bus_id).unwrap_or_else(|e| {
                    warn!(index, "Unable to read NUMA node: {e:?}");
                    None
                }),
                Err(e) => {
                    debug!(index, error = %e, "No PCI info, NUMA node unknown");
                    None
                }
            };
            let (mig_enabled, mig_devices) = match &raw {
                Some(raw) => Self::mig_devices(raw, index, total_memory)?,
                None => (false, Vec::new()),
            };

            gpus.push(GpuDevice {
                index,
                uuid: device.uuid().change_context(nvml_op("uuid"))?,
                name: device.name().change_context(nvml_op("name"))?,
                minor_number: device
                    .minor_number()
                    .change_context(nvml_op("minor_number"))?,
                total_memory,
                numa_node,
                mig_enabled,
                mig_devices,
            });
        }

        debug!(count = gpus.len(), "Enumerated GPUs");
        Ok(gpus)
    }

    fn mig_profiles(&self) -> Result<BTreeSet<MigProfile>, Report<PlatformError>> {
        let nvml = self.nvml()?;
        let raw = self.raw().ok_or_else(|| {
            Report::new(PlatformError::NvmlUnavailable)
                .attach_printable(format!("MIG queries need direct access to {}", self.library))
        })?;
        let count = nvml.device_count().change_context(nvml_op("device_count"))?;

        let mut profiles = BTreeSet::new();
        for index in 0..count {
            let total_memory = nvml
                .device_by_index(index)
                .and_then(|device| device.memory_info())
                .change_context(nvml_op("memory_info"))?
                .total;
            let handle = raw.device_by_index(index)?;
            if raw.mig_enabled(handle)?.is_none() {
                continue;
            }

            for profile_id in raw::GPU_INSTANCE_PROFILE_IDS {
                let Some(info) = raw.gpu_instance_profile(handle, profile_id)? else {
                    continue;
                };
                let gb = mig_memory_size_gb(total_memory, info.memory_size_mb);
                for c in COMPUTE_SLICE_COUNTS
                    .into_iter()
                    .filter(|c| *c <= info.slice_count)
                {
                    let mut profile = MigProfile::new(c, info.slice_count, gb);
                    if let Some(attribute) = raw::profile_attribute(profile_id) {
                        profile = profile.with_attribute(attribute);
                    }
                    profiles.insert(profile);
                }
            }
        }

        Ok(profiles)
    }

    async fn subscribe_health_events(
        &self,
        stop: CancellationToken,
    ) -> Result<mpsc::Receiver<HealthEvent>, Report<PlatformError>> {
        let nvml = self.nvml()?;
        let (tx, rx) = mpsc::channel(HEALTH_EVENT_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::task::spawn_blocking(move || watch_xid_events(&nvml, &stop, &tx, ready_tx));

        match ready_rx.await {
            Ok(registered) => registered.map(|()| rx),
            Err(e) => Err(Report::new(e).change_context(nvml_op("register_events"))),
        }
    }
}

/// Indices of the GPUs able to report critical XID events.
fn xid_capable_devices(nvml: &Nvml) -> Result<Vec<u32>, Report<PlatformError>> {
    let count = nvml.device_count().change_context(nvml_op("device_count"))?;
    let mut indices = Vec::with_capacity(count as usize);
    for index in 0..count {
        let device = nvml
            .device_by_index(index)
            .change_context(nvml_op("device_by_index"))?;
        match device.supported_event_types() {
            Ok(supported) if supported.contains(EventTypes::CRITICAL_XID_ERROR) => {
                indices.push(index);
            }
            Ok(_) => warn!(index, "GPU does not support critical XID events, skipping"),
            Err(e) => warn!(index, error = %e, "Unable to query supported events, skipping"),
        }
    }
    Ok(indices)
}

/// Register every capable GPU for critical XID events.
///
/// NVML releases the event set when a registration fails, so the failing GPU
/// is skipped and the set is rebuilt for the remaining ones.
fn register_xid_events(nvml: &Nvml) -> Result<EventSet<'_>, Report<PlatformError>> {
    let mut indices = xid_capable_devices(nvml)?;

    'rebuild: loop {
        let mut set = nvml
            .create_event_set()
            .change_context(nvml_op("create_event_set"))?;

        for position in 0..indices.len() {
            let index = indices[position];
            let device = nvml
                .device_by_index(index)
                .change_context(nvml_op("device_by_index"))?;
            set = match device.register_events(EventTypes::CRITICAL_XID_ERROR, set) {
                Ok(set) => set,
                Err(NvmlErrorWithSource {
                    error,
                    source: None,
                }) => {
                    warn!(index, error = %error, "Unable to register XID events, skipping GPU");
                    indices.remove(position);
                    continue 'rebuild;
                }
                Err(NvmlErrorWithSource {
                    error,
                    source: Some(source),
                }) => {
                    return Err(Report::new(source)
                        .change_context(nvml_op("register_events"))
                        .attach_printable(error.to_string()));
                }
            };
        }

        debug!(devices = ?indices, "Registered for XID events");
        return Ok(set);
    }
}

fn watch_xid_events(
    nvml: &Nvml,
    stop: &CancellationToken,
    tx: &mpsc::Sender<HealthEvent>,
    ready: oneshot::Sender<Result<(), Report<PlatformError>>>,
) {
    let set = match register_xid_events(nvml) {
        Ok(set) => set,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    loop {
        if stop.is_cancelled() || tx.is_closed() {
            debug!("XID event watcher stopped");
            return;
        }

        let event = match set.wait(EVENT_WAIT_TIMEOUT_MS) {
            Ok(data) => HealthEvent::Xid {
                device_uuid: data.device.uuid().ok(),
                xid: xid_code(data.event_data),
            },
            Err(NvmlError::Timeout) => continue,
            Err(e) => HealthEvent::Error {
                message: e.to_string(),
            },
        };

        if tx.blocking_send(event).is_err() {
            return;
        }
    }
}
