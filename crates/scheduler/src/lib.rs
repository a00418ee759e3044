//! Cluster-wide node and device registry consulted by the scheduler.
//!
//! The registry is the source of truth for which GPUs exist on which node.
//! Node watch handlers mutate it as nodes join, update or leave; the filtering
//! and scoring path reads snapshots of it on every scheduling decision.

pub mod error;
pub mod nodes;

pub use error::SchedulerError;
pub use nodes::NodeInfo;
pub use nodes::NodeManager;
