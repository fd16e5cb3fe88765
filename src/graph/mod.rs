//! Graph data structures and algorithms for NodeFlow
//!
//! This module provides the workflow node/edge model, the derived adjacency
//! structures, and the graph analyzer that validates a graph and produces a
//! layered execution plan.

use thiserror::Error;

pub mod analyzer;
pub mod edge;
pub mod node;

pub use analyzer::{AnalysisReport, ExecutionPlan, GraphAnalyzer, GraphNode};
pub use edge::Edge;
pub use node::Node;

/// Errors specific to graph operations
#[derive(Error, Debug)]
pub enum GraphError {
    /// Referenced node is not part of the graph
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Two nodes share the same id
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    /// A cycle makes the graph unexecutable
    #[error("Cycle detected in graph: {0}")]
    CycleDetected(String),

    /// Structural problem that is not a cycle
    #[error("Invalid graph structure: {0}")]
    InvalidStructure(String),
}
