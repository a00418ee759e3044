//! Test doubles for the platform traits.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::DeviceLib;
use super::GpuDevice;
use super::HealthEvent;
use super::MigDevice;
use super::MigProfile;
use super::PlatformError;
use super::PlatformInfo;
use super::TegraDevice;
use super::HEALTH_EVENT_BUFFER;

#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    pub nvml: bool,
    pub tegra: bool,
    pub tegra_devices: Vec<TegraDevice>,
}

impl MockPlatform {
    pub fn new(nvml: bool, tegra: bool) -> Self {
        Self {
            nvml,
            tegra,
            tegra_devices: Vec::new(),
        }
    }

    pub fn with_tegra_device(mut self, name: &str, paths: &[&str]) -> Self {
        self.tegra_devices.push(TegraDevice {
            name: name.to_string(),
            paths: paths.iter().map(ToString::to_string).collect(),
        });
        self
    }
}

impl PlatformInfo for MockPlatform {
    fn has_nvml(&self) -> (bool, String) {
        (self.nvml, format!("mock nvml={}", self.nvml))
    }

    fn is_tegra_system(&self) -> (bool, String) {
        (self.tegra, format!("mock tegra={}", self.tegra))
    }

    fn tegra_devices(&self) -> Result<Vec<TegraDevice>, Report<PlatformError>> {
        Ok(self.tegra_devices.clone())
    }
}

pub fn gpu(index: u32, name: &str, numa_node: Option<u32>) -> GpuDevice {
    GpuDevice {
        index,
        uuid: format!("GPU-{index}"),
        name: name.to_string(),
        minor_number: index,
        total_memory: 16 << 30,
        numa_node,
        mig_enabled: false,
        mig_devices: Vec::new(),
    }
}

pub fn mig_gpu(index: u32, name: &str, profiles: &[MigProfile]) -> GpuDevice {
    GpuDevice {
        mig_enabled: true,
        mig_devices: profiles
            .iter()
            .enumerate()
            .map(|(slot, profile)| MigDevice {
                index: slot as u32,
                uuid: format!("MIG-{index}-{slot}"),
                profile: profile.clone(),
                total_memory: profile.gb << 30,
            })
            .collect(),
        ..gpu(index, name, None)
    }
}

/// In-memory [`DeviceLib`] that records session use and hands out event
/// channels tests can push into.
#[derive(Debug, Default)]
pub struct MockDeviceLib {
    gpus: Mutex<Vec<GpuDevice>>,
    profiles: BTreeSet<MigProfile>,
    fail_init: bool,
    fail_profiles: bool,
    max_subscriptions: Option<usize>,
    init_delay: Mutex<Duration>,
    open: AtomicUsize,
    init_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
    subscriptions: AtomicUsize,
    event_tx: Mutex<Option<mpsc::Sender<HealthEvent>>>,
}

impl MockDeviceLib {
    pub fn with_gpus(gpus: Vec<GpuDevice>) -> Self {
        Self {
            gpus: Mutex::new(gpus),
            ..Self::default()
        }
    }

    pub fn with_profiles(mut self, profiles: impl IntoIterator<Item = MigProfile>) -> Self {
        self.profiles = profiles.into_iter().collect();
        self
    }

    pub fn with_init_failure(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn with_profile_failure(mut self) -> Self {
        self.fail_profiles = true;
        self
    }

    /// Fail every subscription after the first `max`.
    pub fn with_max_subscriptions(mut self, max: usize) -> Self {
        self.max_subscriptions = Some(max);
        self
    }

    pub fn set_gpus(&self, gpus: Vec<GpuDevice>) {
        *self.gpus.lock().expect("mock lock") = gpus;
    }

    /// Make every later `init` block the calling thread for `delay`.
    pub fn set_init_delay(&self, delay: Duration) {
        *self.init_delay.lock().expect("mock lock") = delay;
    }

    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Push an event to the current subscriber. Returns false without one.
    pub async fn send_event(&self, event: HealthEvent) -> bool {
        let tx = self.event_tx.lock().expect("mock lock").clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// End the current event stream.
    pub fn close_events(&self) {
        self.event_tx.lock().expect("mock lock").take();
    }
}

#[async_trait]
impl DeviceLib for MockDeviceLib {
    fn init(&self) -> Result<(), Report<PlatformError>> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.init_delay.lock().expect("mock lock");
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail_init {
            return Err(Report::new(PlatformError::NvmlUnavailable));
        }
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), Report<PlatformError>> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| open.checked_sub(1))
            .map(|_| ())
            .map_err(|_| Report::new(PlatformError::NotInitialized))
    }

    fn gpus(&self) -> Result<Vec<GpuDevice>, Report<PlatformError>> {
        if self.open_sessions() == 0 {
            return Err(Report::new(PlatformError::NotInitialized));
        }
        Ok(self.gpus.lock().expect("mock lock").clone())
    }

    fn mig_profiles(&self) -> Result<BTreeSet<MigProfile>, Report<PlatformError>> {
        if self.fail_profiles {
            return Err(Report::new(PlatformError::Nvml {
                operation: "mig_profiles".to_string(),
            }));
        }
        Ok(self.profiles.clone())
    }

    async fn subscribe_health_events(
        &self,
        _stop: CancellationToken,
    ) -> Result<mpsc::Receiver<HealthEvent>, Report<PlatformError>> {
        let previous = self.subscriptions.fetch_add(1, Ordering::SeqCst);
        if self.max_subscriptions.is_some_and(|max| previous >= max) {
            return Err(Report::new(PlatformError::Nvml {
                operation: "register_events".to_string(),
            }));
        }
        if self.open_sessions() == 0 {
            return Err(Report::new(PlatformError::NotInitialized));
        }

        let (tx, rx) = mpsc::channel(HEALTH_EVENT_BUFFER);
        *self.event_tx.lock().expect("mock lock") = Some(tx);
        Ok(rx)
    }
}
