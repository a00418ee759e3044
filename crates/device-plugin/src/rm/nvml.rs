use std::collections::HashSet;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::allocate;
use super::device::Device;
use super::device::Devices;
use super::device_map::build_device_map;
use super::health;
use super::health::Delivery;
use super::ResourceManager;
use super::ResourceManagerError;
use crate::config::DeviceConfig;
use crate::config::ResourceName;
use crate::platform::DeviceLib;
use crate::platform::GpuDevice;
use crate::platform::HealthEvent;
use crate::platform::NvmlSession;

/// Build one [`NvmlResourceManager`] per resource with at least one device.
pub(crate) fn new_nvml_resource_managers(
    lib: Arc<dyn DeviceLib>,
    config: &DeviceConfig,
) -> Result<Vec<Arc<dyn ResourceManager>>, Report<ResourceManagerError>> {
    let gpus = enumerate_gpus(lib.clone())?;

    let config = Arc::new(config.clone());
    let managers = build_device_map(&config, &gpus)?
        .into_iter()
        .map(|(resource, devices)| {
            Arc::new(NvmlResourceManager {
                resource,
                devices: RwLock::new(devices),
                config: config.clone(),
                lib: lib.clone(),
            }) as Arc<dyn ResourceManager>
        })
        .collect();
    Ok(managers)
}

/// List the GPUs inside a session of their own.
fn enumerate_gpus(lib: Arc<dyn DeviceLib>) -> Result<Vec<GpuDevice>, Report<ResourceManagerError>> {
    let session =
        NvmlSession::open(lib).change_context(ResourceManagerError::DeviceEnumerationFailed)?;
    session
        .lib()
        .gpus()
        .change_context(ResourceManagerError::DeviceEnumerationFailed)
}

/// Run blocking NVML work on the blocking pool. `Ok(None)` when `stop` fires
/// first; the work then finishes in the background and its result is dropped.
async fn run_blocking<T, F>(
    stop: &CancellationToken,
    context: ResourceManagerError,
    work: F,
) -> Result<Option<T>, Report<ResourceManagerError>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Report<ResourceManagerError>> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);
    tokio::select! {
        biased;
        _ = stop.cancelled() => Ok(None),
        joined = task => match joined {
            Ok(result) => result.map(Some),
            Err(e) => Err(Report::new(e).change_context(context)),
        },
    }
}

/// Live subscription to NVML health events. Dropping it stops the watcher and
/// releases the NVML session.
struct EventWatch {
    events: mpsc::Receiver<HealthEvent>,
    _watcher: DropGuard,
    _session: NvmlSession,
}

/// Resource manager for discrete GPUs and MIG devices reached through NVML.
#[derive(Debug)]
pub struct NvmlResourceManager {
    resource: ResourceName,
    devices: RwLock<Devices>,
    config: Arc<DeviceConfig>,
    lib: Arc<dyn DeviceLib>,
}

impl NvmlResourceManager {
    fn read(&self) -> RwLockReadGuard<'_, Devices> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Devices> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session and subscribe to health events. `Ok(None)` when `stop`
    /// fires before the subscription is in place.
    async fn subscribe(
        &self,
        stop: &CancellationToken,
    ) -> Result<Option<EventWatch>, Report<ResourceManagerError>> {
        let lib = self.lib.clone();
        let session = run_blocking(stop, ResourceManagerError::HealthSubscriptionFailed, move || {
            NvmlSession::open(lib).change_context(ResourceManagerError::HealthSubscriptionFailed)
        })
        .await?;
        let Some(session) = session else {
            return Ok(None);
        };

        let watcher = stop.child_token();
        let events = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(None),
            events = self.lib.subscribe_health_events(watcher.clone()) => {
                events.change_context(ResourceManagerError::HealthSubscriptionFailed)?
            }
        };
        debug!(resource = %self.resource, "Subscribed to health events");

        Ok(Some(EventWatch {
            events,
            _watcher: watcher.drop_guard(),
            _session: session,
        }))
    }

    /// Re-enumerate this resource's devices, keeping unhealthy marks.
    async fn refresh_devices(
        &self,
        stop: &CancellationToken,
    ) -> Result<(), Report<ResourceManagerError>> {
        let lib = self.lib.clone();
        let gpus = run_blocking(stop, ResourceManagerError::DeviceEnumerationFailed, move || {
            enumerate_gpus(lib)
        })
        .await?;
        let Some(gpus) = gpus else {
            return Ok(());
        };

        let fresh = build_device_map(&self.config, &gpus)?
            .remove(&self.resource)
            .unwrap_or_default();

        let mut devices = self.write();
        if fresh.ids() != devices.ids() {
            info!(
                resource = %self.resource,
                before = devices.len(),
                after = fresh.len(),
                "Device set changed"
            );
        }
        *devices = fresh.keep_unhealthy_from(&devices);
        Ok(())
    }

    fn mark_unhealthy(&self, uuid: Option<&str>) -> Vec<Device> {
        self.write().mark_unhealthy(uuid)
    }
}

async fn recv_event(watch: &mut Option<EventWatch>) -> Option<HealthEvent> {
    match watch {
        Some(watch) => watch.events.recv().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl ResourceManager for NvmlResourceManager {
    fn resource(&self) -> &ResourceName {
        &self.resource
    }

    fn devices(&self) -> Devices {
        self.read().clone()
    }

    fn get_preferred_allocation(
        &self,
        available: &[String],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, Report<ResourceManagerError>> {
        allocate::topology_aware(&self.read(), available, required, size)
    }

    async fn check_health(
        &self,
        stop: CancellationToken,
        unhealthy: mpsc::Sender<Device>,
        disable_health_checks: mpsc::Receiver<bool>,
        ack_disable_health_checks: mpsc::Sender<bool>,
    ) -> Result<(), Report<ResourceManagerError>> {
        if self.config.health.disabled {
            info!(resource = %self.resource, "Health checks disabled");
            return health::idle(&stop, disable_health_checks, &ack_disable_health_checks).await;
        }

        let skipped: HashSet<u64> = health::skipped_xids(&self.config.health.skipped_xids);
        let mut toggle = Some(disable_health_checks);
        let Some(initial) = self.subscribe(&stop).await? else {
            return Ok(());
        };
        // `None` while health checks are suspended; no NVML session is held then.
        let mut watch = Some(initial);
        let mut refresh = tokio::time::interval(self.config.health.refresh_interval());
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await;

        info!(resource = %self.resource, "Health checks started");
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!(resource = %self.resource, "Health checks stopped");
                    return Ok(());
                }
                value = health::recv_toggle(&mut toggle) => match value {
                    Some(true) => {
                        watch = None;
                        info!(resource = %self.resource, "Health checks suspended");
                        if !health::acknowledge(&stop, &ack_disable_health_checks, true).await {
                            return Ok(());
                        }
                    }
                    Some(false) => {
                        let resumed = if watch.is_some() {
                            Ok(())
                        } else {
                            match self.subscribe(&stop).await {
                                Ok(Some(resubscribed)) => {
                                    watch = Some(resubscribed);
                                    refresh.reset();
                                    info!(resource = %self.resource, "Health checks resumed");
                                    Ok(())
                                }
                                Ok(None) => return Ok(()),
                                Err(e) => Err(e),
                            }
                        };
                        // The toggle is acknowledged even when resuming failed.
                        if !health::acknowledge(&stop, &ack_disable_health_checks, false).await {
                            return Ok(());
                        }
                        resumed?;
                    }
                    None => toggle = None,
                },
                event = recv_event(&mut watch) => match event {
                    Some(HealthEvent::Xid { device_uuid, xid }) => {
                        if xid.is_some_and(|xid| skipped.contains(&xid)) {
                            info!(resource = %self.resource, xid = ?xid, device = ?device_uuid, "Skipping application XID");
                            continue;
                        }
                        for device in self.mark_unhealthy(device_uuid.as_deref()) {
                            warn!(resource = %self.resource, device = %device.id, xid = ?xid, "Device marked unhealthy");
                            match health::send_or_stop(&stop, &unhealthy, device).await {
                                Delivery::Sent => {}
                                Delivery::Stopped => return Ok(()),
                                Delivery::Closed => {
                                    warn!(resource = %self.resource, "Unhealthy device receiver dropped, stopping health checks");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Some(HealthEvent::Error { message }) => {
                        warn!(resource = %self.resource, %message, "Error waiting for health events");
                    }
                    None => {
                        warn!(resource = %self.resource, "Health event stream closed, resubscribing");
                        drop(watch.take());
                        match self.subscribe(&stop).await? {
                            Some(resubscribed) => watch = Some(resubscribed),
                            None => return Ok(()),
                        }
                    }
                },
                _ = refresh.tick(), if watch.is_some() => {
                    if let Err(e) = self.refresh_devices(&stop).await {
                        warn!(resource = %self.resource, "Failed to refresh devices: {e:?}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::platform::mock::gpu;
    use crate::platform::mock::MockDeviceLib;
    use crate::rm::Health;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        lib: Arc<MockDeviceLib>,
        manager: Arc<dyn ResourceManager>,
        stop: CancellationToken,
        unhealthy: mpsc::Receiver<Device>,
        toggle: mpsc::Sender<bool>,
        ack: mpsc::Receiver<bool>,
        task: tokio::task::JoinHandle<Result<(), Report<ResourceManagerError>>>,
    }

    fn config() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.resources.add_gpu_resource("*", "gpu").expect("valid rule");
        config
    }

    fn manager(lib: &Arc<MockDeviceLib>, config: &DeviceConfig) -> Arc<dyn ResourceManager> {
        let mut managers =
            new_nvml_resource_managers(lib.clone(), config).expect("managers are built");
        assert_eq!(managers.len(), 1);
        managers.remove(0)
    }

    async fn start(lib: MockDeviceLib, config: DeviceConfig) -> Harness {
        start_with_capacity(lib, config, 8).await
    }

    async fn start_with_capacity(
        lib: MockDeviceLib,
        config: DeviceConfig,
        unhealthy_capacity: usize,
    ) -> Harness {
        let lib = Arc::new(lib);
        let manager = manager(&lib, &config);
        let stop = CancellationToken::new();
        let (unhealthy_tx, unhealthy) = mpsc::channel(unhealthy_capacity);
        let (toggle, toggle_rx) = mpsc::channel(1);
        let (ack_tx, ack) = mpsc::channel(1);

        let task = tokio::spawn({
            let manager = manager.clone();
            let stop = stop.clone();
            async move {
                manager
                    .check_health(stop, unhealthy_tx, toggle_rx, ack_tx)
                    .await
            }
        });

        let harness = Harness {
            lib,
            manager,
            stop,
            unhealthy,
            toggle,
            ack,
            task,
        };
        harness.wait_for_subscriptions(1).await;
        harness
    }

    impl Harness {
        async fn wait_for_subscriptions(&self, count: usize) {
            tokio::time::timeout(TIMEOUT, async {
                while self.lib.subscriptions() < count {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("subscription happens");
        }

        async fn xid(&self, uuid: Option<&str>, xid: u64) {
            self.event(uuid, Some(xid)).await;
        }

        async fn event(&self, uuid: Option<&str>, xid: Option<u64>) {
            assert!(
                self.lib
                    .send_event(HealthEvent::Xid {
                        device_uuid: uuid.map(ToString::to_string),
                        xid,
                    })
                    .await
            );
        }

        async fn toggle(&mut self, disabled: bool) -> Option<bool> {
            self.toggle.send(disabled).await.expect("loop running");
            tokio::time::timeout(TIMEOUT, self.ack.recv())
                .await
                .expect("toggle acknowledged")
        }

        async fn join(self) -> Result<(), Report<ResourceManagerError>> {
            tokio::time::timeout(TIMEOUT, self.task)
                .await
                .expect("health check ends")
                .expect("task not panicked")
        }

        async fn next_unhealthy(&mut self) -> Device {
            tokio::time::timeout(TIMEOUT, self.unhealthy.recv())
                .await
                .expect("device reported")
                .expect("channel open")
        }

        async fn finish(self) -> Result<(), Report<ResourceManagerError>> {
            self.stop.cancel();
            tokio::time::timeout(TIMEOUT, self.task)
                .await
                .expect("health check stops")
                .expect("task not panicked")
        }
    }

    fn two_gpus() -> MockDeviceLib {
        MockDeviceLib::with_gpus(vec![gpu(0, "Tesla T4", Some(0)), gpu(1, "Tesla T4", Some(0))])
    }

    #[test]
    fn construction_releases_session() {
        let lib = Arc::new(two_gpus());
        let manager = manager(&lib, &config());
        assert_eq!(manager.resource().as_str(), "nvidia.com/gpu");
        assert_eq!(manager.devices().ids(), vec!["GPU-0", "GPU-1"]);
        assert_eq!(lib.open_sessions(), 0);
        assert_eq!(lib.init_calls(), 1);
    }

    #[test]
    fn preferred_allocation_rejects_small_size() {
        let lib = Arc::new(two_gpus());
        let manager = manager(&lib, &config());
        let required = vec!["GPU-0".to_string(), "GPU-1".to_string()];
        assert!(manager.get_preferred_allocation(&[], &required, 1).is_err());
        assert_eq!(
            manager
                .get_preferred_allocation(&required, &[], 1)
                .expect("valid size"),
            vec!["GPU-0"]
        );
    }

    #[test(tokio::test)]
    async fn xid_marks_device_unhealthy() {
        let mut harness = start(two_gpus(), config()).await;

        harness.xid(Some("GPU-1"), 79).await;
        let device = harness.next_unhealthy().await;
        assert_eq!(device.id, "GPU-1");
        assert_eq!(device.health, Health::Unhealthy);
        assert_eq!(
            harness.manager.devices().get("GPU-1").map(|d| d.health),
            Some(Health::Unhealthy)
        );
        assert!(harness.manager.devices().get("GPU-0").expect("known").is_healthy());

        assert!(harness.finish().await.is_ok());
    }

    #[test(tokio::test)]
    async fn application_xids_are_ignored() {
        let mut config = config();
        config.health.skipped_xids = vec![94];
        let mut harness = start(two_gpus(), config).await;

        harness.xid(Some("GPU-0"), 43).await;
        harness.xid(Some("GPU-0"), 94).await;
        harness.xid(Some("GPU-1"), 48).await;

        assert_eq!(harness.next_unhealthy().await.id, "GPU-1");
        assert!(harness.manager.devices().get("GPU-0").expect("known").is_healthy());
        assert!(harness.finish().await.is_ok());
    }

    #[test(tokio::test)]
    async fn unknown_device_marks_all() {
        let mut harness = start(two_gpus(), config()).await;

        harness.xid(None, 79).await;
        let first = harness.next_unhealthy().await;
        let second = harness.next_unhealthy().await;
        assert_eq!(vec![first.id, second.id], vec!["GPU-0", "GPU-1"]);
        assert!(harness.finish().await.is_ok());
    }

    #[test(tokio::test)]
    async fn error_events_are_skipped() {
        let mut harness = start(two_gpus(), config()).await;

        assert!(
            harness
                .lib
                .send_event(HealthEvent::Error {
                    message: "transient".to_string()
                })
                .await
        );
        harness.xid(Some("GPU-0"), 79).await;
        assert_eq!(harness.next_unhealthy().await.id, "GPU-0");
        assert!(harness.finish().await.is_ok());
    }

    #[test(tokio::test)]
    async fn toggles_release_and_restore_subscription() {
        let mut harness = start(two_gpus(), config()).await;
        assert_eq!(harness.lib.open_sessions(), 1);

        harness.toggle.send(true).await.expect("loop running");
        assert_eq!(harness.ack.recv().await, Some(true));
        assert_eq!(harness.lib.open_sessions(), 0);

        harness.toggle.send(false).await.expect("loop running");
        assert_eq!(harness.ack.recv().await, Some(false));
        assert_eq!(harness.lib.subscriptions(), 2);
        assert_eq!(harness.lib.open_sessions(), 1);

        harness.xid(Some("GPU-0"), 79).await;
        assert_eq!(harness.next_unhealthy().await.id, "GPU-0");

        let lib = harness.lib.clone();
        assert!(harness.finish().await.is_ok());
        assert_eq!(lib.open_sessions(), 0);
    }

    #[test(tokio::test)]
    async fn suspended_health_checks_leave_nvml_alone() {
        let mut config = config();
        config.health.refresh_interval_secs = 1;
        let mut harness = start(two_gpus(), config).await;

        assert_eq!(harness.toggle(true).await, Some(true));
        let init_calls = harness.lib.init_calls();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(harness.lib.init_calls(), init_calls);
        assert_eq!(harness.lib.open_sessions(), 0);

        assert_eq!(harness.toggle(false).await, Some(false));
        assert_eq!(harness.lib.open_sessions(), 1);
        assert!(harness.finish().await.is_ok());
    }

    #[test(tokio::test)]
    async fn failed_resume_is_acknowledged() {
        let mut harness = start(two_gpus().with_max_subscriptions(1), config()).await;

        assert_eq!(harness.toggle(true).await, Some(true));
        assert_eq!(harness.toggle(false).await, Some(false));

        let err = harness.join().await.expect_err("resubscription fails");
        assert!(matches!(
            err.current_context(),
            ResourceManagerError::HealthSubscriptionFailed
        ));
    }

    #[test(tokio::test)]
    async fn stop_interrupts_slow_nvml_init() {
        let mut harness = start(two_gpus(), config()).await;
        assert_eq!(harness.toggle(true).await, Some(true));

        harness.lib.set_init_delay(Duration::from_secs(2));
        harness.toggle.send(false).await.expect("loop running");
        while harness.lib.init_calls() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        harness.stop.cancel();
        let result = tokio::time::timeout(Duration::from_millis(500), harness.task)
            .await
            .expect("health check stops while NVML initializes")
            .expect("task not panicked");
        assert!(result.is_ok());
    }

    #[test(tokio::test)]
    async fn stop_interrupts_blocked_unhealthy_send() {
        let harness = start_with_capacity(two_gpus(), config(), 1).await;

        harness.xid(None, 79).await;
        tokio::time::timeout(TIMEOUT, async {
            while harness.manager.devices().iter().any(Device::is_healthy) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("devices marked");
        // the first device fills the channel, the second send blocks
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(harness.finish().await.is_ok());
    }

    #[test(tokio::test)]
    async fn unknown_xid_code_is_critical() {
        let mut harness = start(two_gpus(), config()).await;

        harness.event(Some("GPU-0"), None).await;
        assert_eq!(harness.next_unhealthy().await.id, "GPU-0");
        assert!(harness.finish().await.is_ok());
    }

    #[test(tokio::test)]
    async fn closed_stream_resubscribes_once() {
        let harness = start(two_gpus().with_max_subscriptions(2), config()).await;

        harness.lib.close_events();
        harness.wait_for_subscriptions(2).await;
        harness.xid(Some("GPU-0"), 79).await;

        harness.lib.close_events();
        let err = harness.join().await.expect_err("resubscription fails");
        assert!(matches!(
            err.current_context(),
            ResourceManagerError::HealthSubscriptionFailed
        ));
    }

    #[test(tokio::test)]
    async fn dropped_receiver_ends_health_checks() {
        let harness = start(two_gpus(), config()).await;
        let Harness {
            lib,
            unhealthy,
            task,
            ..
        } = harness;
        drop(unhealthy);

        assert!(
            lib.send_event(HealthEvent::Xid {
                device_uuid: Some("GPU-0".to_string()),
                xid: Some(79),
            })
            .await
        );
        let result = tokio::time::timeout(TIMEOUT, task)
            .await
            .expect("health check ends")
            .expect("task not panicked");
        assert!(result.is_ok());
    }

    #[test(tokio::test)]
    async fn disabled_health_checks_only_acknowledge() {
        let mut config = config();
        config.health.disabled = true;
        let lib = Arc::new(two_gpus());
        let manager = manager(&lib, &config);

        let stop = CancellationToken::new();
        let (unhealthy_tx, _unhealthy) = mpsc::channel(1);
        let (toggle, toggle_rx) = mpsc::channel(1);
        let (ack_tx, mut ack) = mpsc::channel(1);
        let task = tokio::spawn({
            let stop = stop.clone();
            async move {
                manager
                    .check_health(stop, unhealthy_tx, toggle_rx, ack_tx)
                    .await
            }
        });

        toggle.send(true).await.expect("loop running");
        assert_eq!(ack.recv().await, Some(true));
        assert_eq!(lib.subscriptions(), 0);

        stop.cancel();
        let result = tokio::time::timeout(TIMEOUT, task)
            .await
            .expect("health check stops")
            .expect("task not panicked");
        assert!(result.is_ok());
    }

    #[test(tokio::test)]
    async fn refresh_picks_up_new_devices_and_keeps_marks() {
        let mut config = config();
        config.health.refresh_interval_secs = 1;
        let mut harness = start(two_gpus(), config).await;

        harness.xid(Some("GPU-1"), 79).await;
        harness.next_unhealthy().await;

        harness.lib.set_gpus(vec![
            gpu(0, "Tesla T4", Some(0)),
            gpu(1, "Tesla T4", Some(0)),
            gpu(2, "Tesla T4", Some(1)),
        ]);
        tokio::time::timeout(TIMEOUT, async {
            while harness.manager.devices().len() < 3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("refresh happens");

        let devices = harness.manager.devices();
        assert!(!devices.get("GPU-1").expect("known").is_healthy());
        assert!(devices.get("GPU-2").expect("known").is_healthy());
        assert!(harness.finish().await.is_ok());
    }
}
