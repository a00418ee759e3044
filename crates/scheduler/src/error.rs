use thiserror::Error;

/// Errors returned by the scheduler registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("node {node_id} not found")]
    NodeNotFound { node_id: String },
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, SchedulerError>;
