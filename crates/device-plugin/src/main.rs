use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use clap::Parser;
use device_plugin::config::load_config;
use device_plugin::config::Cli;
use device_plugin::platform::DeviceLib;
use device_plugin::platform::HostPlatform;
use device_plugin::platform::NvmlDeviceLib;
use device_plugin::rm::add_default_resources_to_config;
use device_plugin::rm::new_resource_managers;
use device_plugin::rm::Device;
use device_plugin::rm::ResourceManager;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use utils::version;

const UNHEALTHY_BUFFER: usize = 16;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = utils::logging::init();

    tracing::info!("Starting device plugin {}", &**version::VERSION);

    let mut config = load_config(&cli).await.map_err(|e| anyhow!("{e:?}"))?;
    let platform = HostPlatform::default();
    let nvml: Arc<dyn DeviceLib> = Arc::new(NvmlDeviceLib::default());

    add_default_resources_to_config(&mut config, &platform, &nvml)
        .map_err(|e| anyhow!("{e:?}"))?;
    let managers =
        new_resource_managers(&platform, nvml, &config).map_err(|e| anyhow!("{e:?}"))?;
    if managers.is_empty() {
        tracing::warn!("No devices found, waiting for shutdown");
    }

    let stop = CancellationToken::new();
    let mut tasks = JoinSet::new();
    // Keeping the toggle senders alive keeps health checks enabled.
    let mut toggles = Vec::with_capacity(managers.len());
    for manager in managers {
        toggles.push(spawn_health_check(&mut tasks, manager, &stop));
    }

    wait_for_shutdown(&mut tasks).await?;
    stop.cancel();

    tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while let Some(result) = tasks.join_next().await {
            log_health_check_result(result);
        }
    })
    .await
    .unwrap_or_else(|_| {
        tracing::warn!("Health check shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
    });

    drop(toggles);
    tracing::info!("Device plugin stopped");
    Ok(())
}

type HealthCheckResult =
    Result<(), error_stack::Report<device_plugin::rm::ResourceManagerError>>;

fn spawn_health_check(
    tasks: &mut JoinSet<HealthCheckResult>,
    manager: Arc<dyn ResourceManager>,
    stop: &CancellationToken,
) -> (mpsc::Sender<bool>, mpsc::Receiver<bool>) {
    let (unhealthy_tx, mut unhealthy_rx) = mpsc::channel::<Device>(UNHEALTHY_BUFFER);
    let (toggle_tx, toggle_rx) = mpsc::channel(1);
    let (ack_tx, ack_rx) = mpsc::channel(1);

    let resource = manager.resource().clone();
    tokio::spawn(async move {
        while let Some(device) = unhealthy_rx.recv().await {
            tracing::warn!(
                resource = %resource,
                device = %device.id,
                index = %device.index,
                "Device is unhealthy"
            );
        }
    });

    let stop = stop.clone();
    tasks.spawn(async move {
        manager
            .check_health(stop, unhealthy_tx, toggle_rx, ack_tx)
            .await
    });

    (toggle_tx, ack_rx)
}

fn log_health_check_result(result: Result<HealthCheckResult, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Health check failed: {e:?}"),
        Err(e) => tracing::error!("Health check task failed: {e}"),
    }
}

/// Wait for a termination signal. A health check ending early is logged and
/// does not stop the others.
async fn wait_for_shutdown(tasks: &mut JoinSet<HealthCheckResult>) -> Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                return Ok(());
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                return Ok(());
            }
            Some(result) = tasks.join_next() => {
                tracing::warn!("Health check ended before shutdown");
                log_health_check_result(result);
            }
        }
    }
}
