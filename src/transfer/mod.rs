//! Inter-node data transfer
//!
//! Moves a completed source node's output along an edge into the target
//! node's input mapping, coercing types against the target handler's
//! declared input kinds. Transfers for the same edge are deduplicated;
//! transfers for distinct edges may run in parallel.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ErrorKind, ExecutionError};
use crate::executor::ExecutorRegistry;
use crate::graph::edge::{INPUT_HANDLE, OUTPUT_HANDLE};
use crate::graph::{Edge, Node};
use crate::state::{NodeStatus, StateManager};

pub mod convert;

pub use convert::{convert, ValueKind};

/// Well-known output keys probed when the source handle is absent
const SLOT_ALIASES: [&str; 4] = ["result", "content", "value", "data"];

/// Moves values along edges and validates edge wiring before a run
pub struct DataTransfer {
    state: StateManager,
    registry: Arc<ExecutorRegistry>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    delivered: DashSet<String>,
}

impl DataTransfer {
    /// Create a transfer service over the given state store and registry
    pub fn new(state: StateManager, registry: Arc<ExecutorRegistry>) -> Self {
        Self {
            state,
            registry,
            in_flight: DashMap::new(),
            delivered: DashSet::new(),
        }
    }

    /// Forget all per-run transfer bookkeeping
    pub fn reset(&self) {
        self.in_flight.clear();
        self.delivered.clear();
    }

    /// Forget a single edge so it transfers again after a node reset
    pub fn invalidate(&self, edge_id: &str) {
        self.delivered.remove(edge_id);
    }

    /// Transfer the source output along the edge into the target's inputs
    ///
    /// If another transfer for the same edge is in flight, this call awaits
    /// it and returns without repeating the work.
    pub async fn transfer(&self, edge: &Edge) -> Result<(), ExecutionError> {
        let gate = self
            .in_flight
            .entry(edge.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        if self.delivered.contains(&edge.id) {
            return Ok(());
        }

        let source_state = self.state.get(&edge.source).await.ok_or_else(|| {
            ExecutionError::dependency(format!("source node '{}' has no state", edge.source))
                .with_node(&edge.source)
        })?;
        if source_state.status != NodeStatus::Completed {
            return Err(ExecutionError::dependency(format!(
                "source node '{}' is not completed (status {:?})",
                edge.source, source_state.status
            ))
            .with_node(&edge.source));
        }
        let output = source_state.output.ok_or_else(|| {
            ExecutionError::dependency(format!(
                "source node '{}' completed without recorded output",
                edge.source
            ))
            .with_node(&edge.source)
        })?;

        let value = select_slot(&output, &edge.source_handle);

        let target_node = self.state.node(&edge.target).await.ok_or_else(|| {
            ExecutionError::dependency(format!("target node '{}' not in run", edge.target))
                .with_node(&edge.target)
        })?;
        let expected = self
            .registry
            .get(&target_node.node_type)
            .and_then(|handler| handler.input_type(&edge.target_handle));

        let value = match expected {
            Some(kind) if ValueKind::of(&value) != kind => {
                convert(value, kind).map_err(|e| e.with_node(&edge.target))?
            }
            _ => value,
        };

        debug!(edge_id = %edge.id, source = %edge.source, target = %edge.target, "transferred value");
        self.state.write_input(&edge.target, &edge.target_handle, value).await;
        self.delivered.insert(edge.id.clone());
        Ok(())
    }

    /// Pre-run wiring check: endpoints exist and declared handles are known
    ///
    /// Collects every problem instead of stopping at the first.
    pub fn validate_edges(&self, nodes: &[Node], edges: &[Edge]) -> Vec<ExecutionError> {
        let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let mut errors = Vec::new();

        for edge in edges {
            let source = nodes.iter().find(|n| n.id == edge.source);
            let target = nodes.iter().find(|n| n.id == edge.target);

            if !ids.contains(edge.source.as_str()) {
                errors.push(ExecutionError::new(
                    ErrorKind::Validation,
                    format!("edge '{}' references missing source '{}'", edge.id, edge.source),
                ));
            }
            if !ids.contains(edge.target.as_str()) {
                errors.push(ExecutionError::new(
                    ErrorKind::Validation,
                    format!("edge '{}' references missing target '{}'", edge.id, edge.target),
                ));
            }

            if edge.source_handle != OUTPUT_HANDLE {
                if let Some(handler) = source.and_then(|n| self.registry.get(&n.node_type)) {
                    let outputs = handler.outputs();
                    if !outputs.is_empty() && !outputs.iter().any(|h| h == &edge.source_handle) {
                        errors.push(ExecutionError::new(
                            ErrorKind::Validation,
                            format!(
                                "edge '{}' uses unknown output handle '{}' on node '{}'",
                                edge.id, edge.source_handle, edge.source
                            ),
                        ));
                    }
                }
            }
            if edge.target_handle != INPUT_HANDLE {
                if let Some(handler) = target.and_then(|n| self.registry.get(&n.node_type)) {
                    let handles = handler.input_handles();
                    if !handles.is_empty() && !handles.iter().any(|h| h == &edge.target_handle) {
                        errors.push(ExecutionError::new(
                            ErrorKind::Validation,
                            format!(
                                "edge '{}' uses unknown input handle '{}' on node '{}'",
                                edge.id, edge.target_handle, edge.target
                            ),
                        ));
                    }
                }
            }
        }

        errors
    }
}

/// Pick the slot value a handle addresses within a node output
///
/// A mapping containing the handle wins; otherwise the well-known alias keys
/// are probed in order; otherwise the whole output passes through.
fn select_slot(output: &Value, handle: &str) -> Value {
    if let Value::Object(map) = output {
        if let Some(value) = map.get(handle) {
            return value.clone();
        }
        for alias in SLOT_ALIASES {
            if let Some(value) = map.get(alias) {
                return value.clone();
            }
        }
    }
    output.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeStatePatch;
    use serde_json::json;

    async fn setup(nodes: Vec<Node>, edges: Vec<Edge>) -> (StateManager, DataTransfer) {
        let state = StateManager::new();
        state.begin_run("exec-t", nodes, edges).await;
        let registry = Arc::new(ExecutorRegistry::with_builtins());
        let transfer = DataTransfer::new(state.clone(), registry);
        (state, transfer)
    }

    async fn complete(state: &StateManager, node_id: &str, output: Value) {
        state
            .update(
                node_id,
                NodeStatePatch::new().status(NodeStatus::Completed).output(output),
            )
            .await;
    }

    #[tokio::test]
    async fn test_transfer_extracts_content_alias() {
        let nodes = vec![Node::bare("a", "memo"), Node::bare("b", "connector")];
        let edges = vec![Edge::new("e1", "a", "b")];
        let (state, transfer) = setup(nodes, edges.clone()).await;

        complete(&state, "a", json!({"content": "hi", "timestamp": "t"})).await;
        transfer.transfer(&edges[0]).await.unwrap();

        let inputs = state.inputs_of("b").await;
        assert_eq!(inputs.get("input"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn test_transfer_prefers_explicit_handle() {
        let nodes = vec![Node::bare("s", "script"), Node::bare("b", "connector")];
        let edges = vec![Edge::new("e1", "s", "b").from_handle("stderr")];
        let (state, transfer) = setup(nodes, edges.clone()).await;

        complete(&state, "s", json!({"result": "out", "stderr": "warnings"})).await;
        transfer.transfer(&edges[0]).await.unwrap();

        assert_eq!(state.inputs_of("b").await.get("input"), Some(&json!("warnings")));
    }

    #[tokio::test]
    async fn test_transfer_passes_whole_scalar_output() {
        let nodes = vec![Node::bare("a", "connector"), Node::bare("b", "connector")];
        let edges = vec![Edge::new("e1", "a", "b")];
        let (state, transfer) = setup(nodes, edges.clone()).await;

        complete(&state, "a", json!(42)).await;
        transfer.transfer(&edges[0]).await.unwrap();

        assert_eq!(state.inputs_of("b").await.get("input"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_transfer_requires_completed_source() {
        let nodes = vec![Node::bare("a", "memo"), Node::bare("b", "connector")];
        let edges = vec![Edge::new("e1", "a", "b")];
        let (_state, transfer) = setup(nodes, edges.clone()).await;

        let err = transfer.transfer(&edges[0]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Dependency);
    }

    #[tokio::test]
    async fn test_transfer_deduplicates_per_edge() {
        let nodes = vec![Node::bare("a", "connector"), Node::bare("b", "connector")];
        let edges = vec![Edge::new("e1", "a", "b")];
        let (state, transfer) = setup(nodes, edges.clone()).await;
        let transfer = Arc::new(transfer);

        complete(&state, "a", json!("v")).await;

        let first = transfer.clone();
        let second = transfer.clone();
        let edge_a = edges[0].clone();
        let edge_b = edges[0].clone();
        let (r1, r2) = tokio::join!(
            async move { first.transfer(&edge_a).await },
            async move { second.transfer(&edge_b).await },
        );
        r1.unwrap();
        r2.unwrap();

        // After invalidation the edge transfers again.
        transfer.invalidate("e1");
        transfer.transfer(&edges[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_edges_collects_all_problems() {
        let nodes = vec![Node::bare("a", "memo"), Node::bare("b", "connector")];
        let edges = vec![
            Edge::new("e1", "a", "ghost"),
            Edge::new("e2", "a", "b").from_handle("sidechannel"),
        ];
        let (_state, transfer) = setup(nodes.clone(), edges.clone()).await;

        let errors = transfer.validate_edges(&nodes, &edges);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.message.contains("ghost")));
        assert!(errors.iter().any(|e| e.message.contains("sidechannel")));
    }

    #[test]
    fn test_select_slot_alias_order() {
        let output = json!({"value": 1, "data": 2});
        assert_eq!(select_slot(&output, "output"), json!(1));
        let output = json!({"result": "r", "content": "c"});
        assert_eq!(select_slot(&output, "output"), json!("r"));
    }

    #[test]
    fn test_select_slot_skip_sentinel_passthrough() {
        let sentinel = crate::executor::skip_sentinel();
        assert_eq!(select_slot(&sentinel, "output"), sentinel);
    }
}
