//! Node registry with reader/writer locking
//!
//! Every node entry moves through `absent -> present -> absent`. Updates replace
//! the whole [`NodeInfo`]; there is no field-level merge.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use api_types::DeviceInfo;
use api_types::GPU_NO_USE_UUID_ANNOTATION;
use api_types::NVIDIA_GPU_DEVICE;
use k8s_openapi::api::core::v1::Node;
use tracing::debug;
use tracing::info;

use crate::error::Result;
use crate::error::SchedulerError;

/// One cluster node's inventory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfo {
    pub id: String,
    /// Orchestrator node object, only read for its annotations
    pub node: Arc<Node>,
    pub devices: Vec<DeviceInfo>,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, node: Arc<Node>, devices: Vec<DeviceInfo>) -> Self {
        Self {
            id: id.into(),
            node,
            devices,
        }
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.node
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }
}

/// Process-wide registry mapping node identifiers to their inventory.
///
/// Shared explicitly as `Arc<NodeManager>` between watch handlers and the
/// scheduling path. Reads clone out under the read lock; nothing blocks on I/O
/// while a lock is held.
#[derive(Debug)]
pub struct NodeManager {
    nodes: RwLock<HashMap<String, NodeInfo>>,
    /// Vendor whose devices node annotations may exclude
    vendor: String,
}

impl Default for NodeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeManager {
    /// Create an empty registry tracking NVIDIA devices.
    pub fn new() -> Self {
        Self::with_vendor(NVIDIA_GPU_DEVICE)
    }

    /// Create an empty registry whose annotation pruning applies to `vendor`.
    pub fn with_vendor(vendor: impl Into<String>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            vendor: vendor.into(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, NodeInfo>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, NodeInfo>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite the entry for `node_id`.
    ///
    /// The inventory is stored as given; validating it is the caller's job.
    pub fn add_node(&self, node_id: &str, node_info: NodeInfo) {
        let device_count = node_info.devices.len();
        let replaced = self
            .write()
            .insert(node_id.to_string(), node_info)
            .is_some();

        debug!(
            node_id = %node_id,
            device_count = device_count,
            replaced = replaced,
            "Node registered"
        );
    }

    /// Look up one node.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::NodeNotFound`] if `node_id` is not registered
    pub fn get_node(&self, node_id: &str) -> Result<NodeInfo> {
        self.read()
            .get(node_id)
            .cloned()
            .ok_or_else(|| SchedulerError::NodeNotFound {
                node_id: node_id.to_string(),
            })
    }

    /// Snapshot of every registered node.
    ///
    /// The returned map is detached from the registry; later mutations do not
    /// show up in it.
    pub fn list_nodes(&self) -> HashMap<String, NodeInfo> {
        self.read().clone()
    }

    /// Remove a node that left the cluster.
    pub fn rm_node(&self, node_id: &str) -> Option<NodeInfo> {
        let removed = self.write().remove(node_id);
        if removed.is_some() {
            info!(node_id = %node_id, "Node removed from registry");
        }
        removed
    }

    /// Drop every device of `vendor` from `node_id`'s inventory.
    ///
    /// Unknown nodes and an empty vendor are no-ops. The node entry is kept
    /// even when no devices remain.
    pub fn rm_node_devices(&self, node_id: &str, vendor: &str) {
        if vendor.is_empty() {
            return;
        }

        let mut nodes = self.write();
        let Some(node_info) = nodes.get_mut(node_id) else {
            return;
        };

        let before = node_info.devices.len();
        node_info.devices.retain(|device| !device.is_vendor(vendor));
        let removed = before - node_info.devices.len();

        if removed > 0 {
            info!(
                node_id = %node_id,
                vendor = %vendor,
                removed = removed,
                remaining = node_info.devices.len(),
                "Removed node devices"
            );
        }
    }

    /// Filter out the device the node operator disabled through the
    /// [`GPU_NO_USE_UUID_ANNOTATION`] annotation.
    ///
    /// Only devices of this registry's vendor are excluded. The registry itself
    /// is not touched.
    pub fn rm_device_by_node_annotation(&self, node_info: &NodeInfo) -> Vec<DeviceInfo> {
        let Some(disabled_id) = node_info.annotation(GPU_NO_USE_UUID_ANNOTATION) else {
            return node_info.devices.clone();
        };

        node_info
            .devices
            .iter()
            .filter(|device| {
                let excluded = device.id == disabled_id && device.is_vendor(&self.vendor);
                if excluded {
                    debug!(
                        node_id = %node_info.id,
                        device = %device.id,
                        "Device disabled by node annotation"
                    );
                }
                !excluded
            })
            .cloned()
            .collect()
    }
}
