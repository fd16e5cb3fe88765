//! State management for workflow execution
//!
//! The [`StateManager`] is the sole writer of per-node state. Other
//! components ask it to apply partial patches; it enforces terminality,
//! recomputes run-level flags, and fans changes out to listeners.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::executor::InputMap;
use crate::graph::{Edge, Node};

/// Lifecycle status of a node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for dependencies or admission
    Pending,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled before or during execution
    Cancelled,
}

impl NodeStatus {
    /// Whether this status ends the node's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled)
    }
}

/// Observable state of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Node this state belongs to
    pub node_id: String,

    /// Current lifecycle status
    pub status: NodeStatus,

    /// When execution started
    pub start_time: Option<DateTime<Utc>>,

    /// When execution finished
    pub end_time: Option<DateTime<Utc>>,

    /// Output value, set exactly once on completion
    pub output: Option<Value>,

    /// Error message, set exactly once on failure
    pub error: Option<String>,

    /// Completion percentage, 0-100
    pub progress: u8,
}

impl NodeState {
    /// Fresh pending state for a node
    pub fn pending(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            start_time: None,
            end_time: None,
            output: None,
            error: None,
            progress: 0,
        }
    }
}

/// Partial patch applied over a node's current state
#[derive(Debug, Clone, Default)]
pub struct NodeStatePatch {
    /// New status
    pub status: Option<NodeStatus>,

    /// New start timestamp
    pub start_time: Option<DateTime<Utc>>,

    /// New end timestamp
    pub end_time: Option<DateTime<Utc>>,

    /// New output value
    pub output: Option<Value>,

    /// New error message
    pub error: Option<String>,

    /// New progress percentage
    pub progress: Option<u8>,

    /// Explicitly reset the node before applying, bypassing terminality
    pub reset: bool,
}

impl NodeStatePatch {
    /// Empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status
    pub fn status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the output value
    pub fn output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Set the error message
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Set the progress percentage
    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Clear the node back to pending before applying this patch
    pub fn reset(mut self) -> Self {
        self.reset = true;
        self
    }
}

/// Per-run execution context owned by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Run identifier
    pub execution_id: String,

    /// Node set for this run
    pub nodes: Vec<Node>,

    /// Edge set for this run
    pub edges: Vec<Edge>,

    /// Per-node state keyed by node id
    pub node_states: HashMap<String, NodeState>,

    /// Cross-node storage; `<node_id>_inputs` keys hold input mappings
    pub global_data: HashMap<String, Value>,

    /// Whether any node is currently running
    pub is_running: bool,

    /// When the run started
    pub start_time: Option<DateTime<Utc>>,

    /// When the run finished
    pub end_time: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    /// Fresh context with every node pending
    pub fn new(execution_id: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let node_states = nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::pending(&n.id)))
            .collect();
        Self {
            execution_id: execution_id.into(),
            nodes,
            edges,
            node_states,
            global_data: HashMap::new(),
            is_running: false,
            start_time: None,
            end_time: None,
        }
    }

    /// Empty context used before the first run
    pub fn empty() -> Self {
        Self::new("", Vec::new(), Vec::new())
    }

    /// Look up a node definition
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

/// Key under which a node's resolved inputs live in `global_data`
pub fn inputs_key(node_id: &str) -> String {
    format!("{}_inputs", node_id)
}

/// Aggregated progress over a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    /// Completed share of all nodes, 0-100
    pub percentage: f64,

    /// Nodes in `Completed`
    pub completed: usize,

    /// Total nodes in the run
    pub total: usize,

    /// Nodes in `Running`
    pub running: usize,

    /// Nodes in `Failed`
    pub failed: usize,
}

/// Summary statistics for a finished (or in-flight) run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Total nodes in the run
    pub total_nodes: usize,

    /// Nodes that completed
    pub completed: usize,

    /// Nodes that failed
    pub failed: usize,

    /// Nodes that were cancelled
    pub cancelled: usize,

    /// Wall-clock duration of the run in milliseconds
    pub total_duration_ms: u64,

    /// Mean per-node execution duration in milliseconds
    pub average_node_duration_ms: f64,

    /// Sum of node execution time over wall-clock time
    pub parallelism_utilization: f64,
}

type ChangeListener = Arc<dyn Fn(&NodeState) + Send + Sync>;

/// Authoritative node-state store with change notification
///
/// Cheap to clone; clones share the same underlying context.
pub struct StateManager {
    context: Arc<RwLock<ExecutionContext>>,
    listeners: Arc<parking_lot::RwLock<Vec<ChangeListener>>>,
    history: Arc<parking_lot::Mutex<VecDeque<ExecutionContext>>>,
    history_capacity: usize,
    history_task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            listeners: self.listeners.clone(),
            history: self.history.clone(),
            history_capacity: self.history_capacity,
            history_task: self.history_task.clone(),
        }
    }
}

impl StateManager {
    /// Create a manager with an empty context
    pub fn new() -> Self {
        Self::with_history_capacity(100)
    }

    /// Create a manager with an explicit history ring size
    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self {
            context: Arc::new(RwLock::new(ExecutionContext::empty())),
            listeners: Arc::new(parking_lot::RwLock::new(Vec::new())),
            history: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
            history_capacity,
            history_task: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Replace the context for a fresh run
    pub async fn begin_run(&self, execution_id: &str, nodes: Vec<Node>, edges: Vec<Edge>) {
        let mut ctx = self.context.write().await;
        *ctx = ExecutionContext::new(execution_id, nodes, edges);
        drop(ctx);
        self.history.lock().clear();
    }

    /// Register a change listener, invoked synchronously on every update
    pub fn on_change(&self, listener: impl Fn(&NodeState) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Drop all registered listeners
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
    }

    /// Apply a partial patch to a node's state
    ///
    /// Terminal states are immutable except through an explicit reset patch.
    /// Timestamps are maintained automatically: entering `Running` stamps
    /// `start_time`, entering a terminal status stamps `end_time`.
    pub async fn update(&self, node_id: &str, patch: NodeStatePatch) -> NodeState {
        let updated = {
            let mut ctx = self.context.write().await;
            let entry = ctx
                .node_states
                .entry(node_id.to_string())
                .or_insert_with(|| NodeState::pending(node_id));

            if entry.status.is_terminal() && !patch.reset {
                warn!(node_id, status = ?entry.status, "ignoring update to terminal node state");
                return entry.clone();
            }

            if patch.reset {
                *entry = NodeState::pending(node_id);
            }
            if let Some(status) = patch.status {
                entry.status = status;
                if status == NodeStatus::Running && entry.start_time.is_none() {
                    entry.start_time = Some(Utc::now());
                }
                if status.is_terminal() && entry.end_time.is_none() {
                    entry.end_time = Some(Utc::now());
                }
                if status == NodeStatus::Completed {
                    entry.progress = 100;
                }
            }
            if let Some(start) = patch.start_time {
                entry.start_time = Some(start);
            }
            if let Some(end) = patch.end_time {
                entry.end_time = Some(end);
            }
            if let Some(output) = patch.output {
                entry.output = Some(output);
            }
            if let Some(message) = patch.error {
                entry.error = Some(message);
            }
            if let Some(progress) = patch.progress {
                entry.progress = progress;
            }
            let updated = entry.clone();

            let any_running = ctx.node_states.values().any(|s| s.status == NodeStatus::Running);
            if any_running && !ctx.is_running {
                ctx.is_running = true;
                if ctx.start_time.is_none() {
                    ctx.start_time = Some(Utc::now());
                }
            } else if !any_running && ctx.is_running {
                ctx.is_running = false;
                ctx.end_time = Some(Utc::now());
            }
            updated
        };

        self.notify(&updated);
        updated
    }

    fn notify(&self, state: &NodeState) {
        let listeners: Vec<ChangeListener> = self.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
                error!(node_id = %state.node_id, "state listener panicked");
            }
        }
    }

    /// Current state of a node
    pub async fn get(&self, node_id: &str) -> Option<NodeState> {
        self.context.read().await.node_states.get(node_id).cloned()
    }

    /// Current status of a node
    pub async fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.context.read().await.node_states.get(node_id).map(|s| s.status)
    }

    /// Snapshot of every node's status
    pub async fn statuses(&self) -> HashMap<String, NodeStatus> {
        self.context
            .read()
            .await
            .node_states
            .iter()
            .map(|(id, state)| (id.clone(), state.status))
            .collect()
    }

    /// Node definition lookup
    pub async fn node(&self, node_id: &str) -> Option<Node> {
        self.context.read().await.node(node_id).cloned()
    }

    /// Run identifier of the current context
    pub async fn execution_id(&self) -> String {
        self.context.read().await.execution_id.clone()
    }

    /// Write a resolved input value for a node
    pub async fn write_input(&self, target_id: &str, handle: &str, value: Value) {
        let mut ctx = self.context.write().await;
        let entry = ctx
            .global_data
            .entry(inputs_key(target_id))
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(map) = entry {
            map.insert(handle.to_string(), value);
        }
    }

    /// Resolved inputs of a node, empty when none were transferred
    pub async fn inputs_of(&self, node_id: &str) -> InputMap {
        let ctx = self.context.read().await;
        match ctx.global_data.get(&inputs_key(node_id)) {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => InputMap::new(),
        }
    }

    /// Mark the run as started
    pub async fn mark_run_started(&self) {
        let mut ctx = self.context.write().await;
        ctx.is_running = true;
        ctx.start_time = Some(Utc::now());
        ctx.end_time = None;
    }

    /// Mark the run as finished
    pub async fn mark_run_finished(&self) {
        let mut ctx = self.context.write().await;
        ctx.is_running = false;
        if ctx.end_time.is_none() {
            ctx.end_time = Some(Utc::now());
        }
    }

    /// Aggregated progress over the current run
    pub async fn progress(&self) -> Progress {
        let ctx = self.context.read().await;
        let total = ctx.node_states.len();
        let completed = ctx
            .node_states
            .values()
            .filter(|s| s.status == NodeStatus::Completed)
            .count();
        let running = ctx
            .node_states
            .values()
            .filter(|s| s.status == NodeStatus::Running)
            .count();
        let failed = ctx
            .node_states
            .values()
            .filter(|s| s.status == NodeStatus::Failed)
            .count();
        Progress {
            percentage: if total == 0 { 100.0 } else { completed as f64 * 100.0 / total as f64 },
            completed,
            total,
            running,
            failed,
        }
    }

    /// Summary statistics for the current run
    pub async fn statistics(&self) -> ExecutionStats {
        let ctx = self.context.read().await;
        let total_nodes = ctx.node_states.len();
        let mut completed = 0;
        let mut failed = 0;
        let mut cancelled = 0;
        let mut busy_ms = 0i64;
        let mut measured = 0usize;
        for state in ctx.node_states.values() {
            match state.status {
                NodeStatus::Completed => completed += 1,
                NodeStatus::Failed => failed += 1,
                NodeStatus::Cancelled => cancelled += 1,
                _ => {}
            }
            if let (Some(start), Some(end)) = (state.start_time, state.end_time) {
                busy_ms += (end - start).num_milliseconds().max(0);
                measured += 1;
            }
        }
        let wall_ms = match (ctx.start_time, ctx.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            (Some(start), None) => (Utc::now() - start).num_milliseconds().max(0) as u64,
            _ => 0,
        };
        ExecutionStats {
            total_nodes,
            completed,
            failed,
            cancelled,
            total_duration_ms: wall_ms,
            average_node_duration_ms: if measured == 0 {
                0.0
            } else {
                busy_ms as f64 / measured as f64
            },
            parallelism_utilization: if wall_ms == 0 {
                0.0
            } else {
                busy_ms as f64 / wall_ms as f64
            },
        }
    }

    /// Structural copy of the current context
    pub async fn snapshot(&self) -> ExecutionContext {
        self.context.read().await.clone()
    }

    /// Replace the context atomically
    pub async fn restore(&self, snapshot: ExecutionContext) {
        let mut ctx = self.context.write().await;
        *ctx = snapshot;
    }

    /// Start periodic history snapshots while the run is live
    pub fn start_history(&self, interval: Duration) {
        let manager = self.clone();
        let mut guard = self.history_task.lock();
        if let Some(task) = guard.take() {
            task.abort();
        }
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let snapshot = manager.snapshot().await;
                if !snapshot.is_running {
                    continue;
                }
                let mut history = manager.history.lock();
                if history.len() >= manager.history_capacity {
                    history.pop_front();
                }
                history.push_back(snapshot);
            }
        }));
    }

    /// Stop the periodic history task
    pub fn stop_history(&self) {
        if let Some(task) = self.history_task.lock().take() {
            task.abort();
        }
    }

    /// Recorded history snapshots, oldest first
    pub fn history(&self) -> Vec<ExecutionContext> {
        self.history.lock().iter().cloned().collect()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
