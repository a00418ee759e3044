//! Building blocks shared by the health check loops.

use std::collections::HashSet;

use error_stack::Report;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::ResourceManagerError;

/// XIDs caused by applications rather than the device. They never mark a
/// device unhealthy.
pub(crate) const DEFAULT_SKIPPED_XIDS: [u64; 6] = [
    13,  // Graphics Engine Exception
    31,  // GPU memory page fault
    43,  // GPU stopped processing
    45,  // Preemptive cleanup, due to previous errors
    68,  // Video processor exception
    109, // Context Switch Timeout Error
];

pub(crate) fn skipped_xids(extra: &[u64]) -> HashSet<u64> {
    DEFAULT_SKIPPED_XIDS
        .iter()
        .chain(extra)
        .copied()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    Stopped,
    Closed,
}

/// Send `value` unless `stop` fires first.
pub(crate) async fn send_or_stop<T>(
    stop: &CancellationToken,
    tx: &mpsc::Sender<T>,
    value: T,
) -> Delivery {
    tokio::select! {
        biased;
        _ = stop.cancelled() => Delivery::Stopped,
        sent = tx.send(value) => match sent {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        },
    }
}

/// Next toggle value, `None` once the channel is closed. Waits forever after
/// the receiver was dropped.
pub(crate) async fn recv_toggle(toggle: &mut Option<mpsc::Receiver<bool>>) -> Option<bool> {
    match toggle {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Acknowledge a toggle. Returns false when `stop` fired meanwhile.
pub(crate) async fn acknowledge(
    stop: &CancellationToken,
    ack: &mpsc::Sender<bool>,
    disabled: bool,
) -> bool {
    match send_or_stop(stop, ack, disabled).await {
        Delivery::Sent => true,
        Delivery::Stopped => false,
        Delivery::Closed => {
            warn!(disabled, "Health check toggle acknowledgement dropped");
            true
        }
    }
}

/// Health loop without an event source: only services `stop` and toggles.
pub(crate) async fn idle(
    stop: &CancellationToken,
    toggle: mpsc::Receiver<bool>,
    ack: &mpsc::Sender<bool>,
) -> Result<(), Report<ResourceManagerError>> {
    let mut toggle = Some(toggle);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            value = recv_toggle(&mut toggle) => match value {
                Some(disabled) => {
                    debug!(disabled, "Health checks toggled while idle");
                    if !acknowledge(stop, ack, disabled).await {
                        return Ok(());
                    }
                }
                None => toggle = None,
            },
        }
    }
}
