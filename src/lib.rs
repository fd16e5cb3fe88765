//! # NodeFlow
//!
//! A workflow execution engine for node-based editors.
//!
//! ## Overview
//!
//! NodeFlow executes user-authored directed acyclic graphs of heterogeneous
//! computational nodes (memos, file reads, script invocations, pass-through
//! connectors), honoring data dependencies, bounded parallelism, per-node
//! retry and fallback policies, and observable progress.
//!
//! ## Key Features
//!
//! - **Graph analysis**: cycle detection and layered execution planning
//! - **Bounded parallelism**: a cooperative dispatcher with a configurable
//!   concurrency limit and priority-ordered admission
//! - **Data transfer**: typed value movement along edges with coercion
//! - **Error recovery**: an ordered chain of retry / fallback / skip / stop
//!   strategies
//! - **Observable state**: an authoritative per-node state store with
//!   progress aggregation, snapshots, and change notification
//! - **Async execution**: fully async/await compatible with the Tokio runtime

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for NodeFlow operations
pub type Result<T> = std::result::Result<T, NodeFlowError>;

/// Main error type for NodeFlow operations
#[derive(Error, Debug)]
pub enum NodeFlowError {
    /// Graph structure error (cycles, missing nodes, etc.)
    #[error("Graph structure error: {0}")]
    GraphStructure(#[from] graph::GraphError),

    /// Execution error raised by a node, a transfer, or the scheduler
    #[error("Execution error: {0}")]
    Execution(#[from] error::ExecutionError),

    /// Queue scheduling error
    #[error("Queue error: {0}")]
    Queue(#[from] queue::QueueError),

    /// State management error
    #[error("State error: {0}")]
    State(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error taxonomy shared by every component
pub mod error;

/// Core graph module containing the node/edge model and the analyzer
pub mod graph;

/// Host collaborator interfaces (script runner, file reader, clock)
pub mod host;

/// Node executor registry and built-in handlers
pub mod executor;

/// Inter-node data transfer and type coercion
pub mod transfer;

/// Error recovery strategy chain
pub mod recovery;

/// Bounded-parallelism execution queue
pub mod queue;

/// Authoritative node-state store and progress aggregation
pub mod state;

/// Workflow engine facade
pub mod engine;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_creation() {
        let node = graph::Node::new("n1", "memo", serde_json::json!({"content": "hi"}));

        assert_eq!(node.id, "n1");
        assert_eq!(node.node_type, "memo");
    }

    #[test]
    fn test_error_conversion() {
        let err = error::ExecutionError::new(error::ErrorKind::Runtime, "boom");
        let top: NodeFlowError = err.into();
        matches!(top, NodeFlowError::Execution(_));
    }
}
