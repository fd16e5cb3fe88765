//! Workflow engine facade
//!
//! Wires the analyzer, executor registry, data transfer, error recovery,
//! queue, and state manager behind a single `run(nodes, edges)` call. The
//! engine owns the execution context for the duration of a run and delivers
//! lifecycle callbacks and a typed event stream to observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, ExecutionError};
use crate::executor::{ExecutorContext, ExecutorRegistry};
use crate::graph::{Edge, ExecutionPlan, GraphAnalyzer, Node};
use crate::host::HostServices;
use crate::queue::{ExecutionQueue, QueueSignal};
use crate::recovery::{ErrorHandler, RecoveryAction, RecoveryConfig, RecoveryDecision};
use crate::state::{
    ExecutionContext as RunContext, ExecutionStats, NodeState, Progress, StateManager,
};
use crate::{NodeFlowError, Result};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently running nodes
    pub max_parallelism: usize,

    /// When disabled, the first node failure rejects the run
    pub recovery_enabled: bool,

    /// Recovery chain configuration
    pub recovery: RecoveryConfig,

    /// Wall-clock budget per script invocation
    pub script_timeout: Duration,

    /// Interval between automatic history snapshots
    pub history_interval: Duration,

    /// Bound on retained history snapshots
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            recovery_enabled: true,
            recovery: RecoveryConfig::default(),
            script_timeout: Duration::from_secs(10),
            history_interval: Duration::from_secs(5),
            history_capacity: 100,
        }
    }
}

/// Typed engine events delivered to stream subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run was admitted and enqueued
    RunStarted {
        /// Run identifier
        execution_id: String,
        /// Monotonic timestamp in milliseconds
        at_ms: u64,
        /// Number of nodes in the plan
        total_nodes: usize,
    },

    /// A node transitioned to running
    NodeStarted {
        /// Run identifier
        execution_id: String,
        /// Monotonic timestamp in milliseconds
        at_ms: u64,
        /// Node that started
        node_id: String,
    },

    /// A node completed with an output
    NodeCompleted {
        /// Run identifier
        execution_id: String,
        /// Monotonic timestamp in milliseconds
        at_ms: u64,
        /// Node that completed
        node_id: String,
        /// Output value
        output: Value,
    },

    /// A node failed
    NodeFailed {
        /// Run identifier
        execution_id: String,
        /// Monotonic timestamp in milliseconds
        at_ms: u64,
        /// Node that failed
        node_id: String,
        /// Failure message
        message: String,
    },

    /// Aggregated progress changed
    Progress {
        /// Run identifier
        execution_id: String,
        /// Monotonic timestamp in milliseconds
        at_ms: u64,
        /// Current progress
        progress: Progress,
    },

    /// The run finished
    RunCompleted {
        /// Run identifier
        execution_id: String,
        /// Monotonic timestamp in milliseconds
        at_ms: u64,
        /// Final statistics
        stats: ExecutionStats,
    },

    /// The run aborted
    RunFailed {
        /// Run identifier
        execution_id: String,
        /// Monotonic timestamp in milliseconds
        at_ms: u64,
        /// Abort reason
        message: String,
    },
}

type StartCallback = Arc<dyn Fn(&str) + Send + Sync>;
type CompleteCallback = Arc<dyn Fn(&ExecutionStats) + Send + Sync>;
type NodeStartCallback = Arc<dyn Fn(&str) + Send + Sync>;
type NodeCompleteCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
type NodeErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ExecutionError) + Send + Sync>;

/// Lifecycle callbacks fired during a run
#[derive(Default, Clone)]
pub struct WorkflowCallbacks {
    /// Fired once the run is admitted, with the execution id
    pub on_start: Option<StartCallback>,

    /// Fired when the run finishes, with the final statistics
    pub on_complete: Option<CompleteCallback>,

    /// Fired when a node starts
    pub on_node_start: Option<NodeStartCallback>,

    /// Fired when a node completes, with its output
    pub on_node_complete: Option<NodeCompleteCallback>,

    /// Fired when a node fails, with the message
    pub on_node_error: Option<NodeErrorCallback>,

    /// Fired after each completion with aggregated progress
    pub on_progress: Option<ProgressCallback>,

    /// Fired for unhandled engine-level errors
    pub on_error: Option<ErrorCallback>,
}

impl WorkflowCallbacks {
    /// Empty callback set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run-start callback
    pub fn on_start(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    /// Set the run-complete callback
    pub fn on_complete(mut self, f: impl Fn(&ExecutionStats) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    /// Set the node-start callback
    pub fn on_node_start(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_node_start = Some(Arc::new(f));
        self
    }

    /// Set the node-complete callback
    pub fn on_node_complete(
        mut self,
        f: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) -> Self {
        self.on_node_complete = Some(Arc::new(f));
        self
    }

    /// Set the node-error callback
    pub fn on_node_error(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_node_error = Some(Arc::new(f));
        self
    }

    /// Set the progress callback
    pub fn on_progress(mut self, f: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Set the engine-error callback
    pub fn on_error(mut self, f: impl Fn(&ExecutionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

/// Workflow engine facade
pub struct WorkflowEngine {
    config: EngineConfig,
    registry: Arc<ExecutorRegistry>,
    hosts: Arc<HostServices>,
    state: StateManager,
    queue: ExecutionQueue,
    signals: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueSignal>>,
    transfer: crate::transfer::DataTransfer,
    recovery: ErrorHandler,
    callbacks: parking_lot::RwLock<WorkflowCallbacks>,
    subscribers: parking_lot::Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
    edges_by_source: parking_lot::RwLock<HashMap<String, Vec<Edge>>>,
    run_active: AtomicBool,
    stop_requested: AtomicBool,
}

impl WorkflowEngine {
    /// Engine with default configuration, built-in handlers, in-memory hosts
    pub fn new() -> Self {
        Self::with_hosts(EngineConfig::default(), Arc::new(HostServices::in_memory()))
    }

    /// Engine with explicit configuration and in-memory hosts
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_hosts(config, Arc::new(HostServices::in_memory()))
    }

    /// Engine with explicit configuration and host collaborators
    pub fn with_hosts(config: EngineConfig, hosts: Arc<HostServices>) -> Self {
        let registry = Arc::new(ExecutorRegistry::with_builtins());
        let state = StateManager::with_history_capacity(config.history_capacity);
        let (queue, signals) =
            ExecutionQueue::new(config.max_parallelism, registry.clone(), state.clone());
        let transfer = crate::transfer::DataTransfer::new(state.clone(), registry.clone());
        let recovery = ErrorHandler::new(state.clone(), config.recovery.clone());
        Self {
            config,
            registry,
            hosts,
            state,
            queue,
            signals: tokio::sync::Mutex::new(signals),
            transfer,
            recovery,
            callbacks: parking_lot::RwLock::new(WorkflowCallbacks::default()),
            subscribers: parking_lot::Mutex::new(Vec::new()),
            edges_by_source: parking_lot::RwLock::new(HashMap::new()),
            run_active: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Register an additional node executor
    pub fn register_executor(
        &self,
        type_tag: impl Into<String>,
        handler: Arc<dyn crate::executor::NodeExecutor>,
    ) {
        self.registry.register(type_tag, handler);
    }

    /// Register a fallback node for a potential failure
    pub fn register_fallback(&self, node_id: impl Into<String>, fallback_id: impl Into<String>) {
        self.recovery.register_fallback(node_id, fallback_id);
    }

    /// Install lifecycle callbacks
    pub fn set_callbacks(&self, callbacks: WorkflowCallbacks) {
        *self.callbacks.write() = callbacks;
    }

    /// Subscribe to the typed event stream
    pub fn events(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// The state manager backing this engine
    pub fn state_manager(&self) -> &StateManager {
        &self.state
    }

    /// Errors logged by the recovery chain, oldest first
    pub fn errors(&self) -> Vec<ExecutionError> {
        self.recovery.errors()
    }

    /// Retries consumed by a node in the current run
    pub fn retry_count(&self, node_id: &str) -> u32 {
        self.recovery.retry_count(node_id)
    }

    fn emit(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    fn now_ms(&self) -> u64 {
        self.hosts.clock.now_millis()
    }

    /// Execute a graph to completion
    ///
    /// Validates and plans the graph, enqueues it, and awaits termination:
    /// the queue empty, nothing running, and no pending node dispatchable.
    #[instrument(skip(self, nodes, edges))]
    pub async fn run(&self, nodes: Vec<Node>, edges: Vec<Edge>) -> Result<ExecutionStats> {
        if self.run_active.swap(true, Ordering::SeqCst) {
            return Err(ExecutionError::runtime("a run is already active").into());
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        let result = self.run_inner(nodes, edges).await;
        self.run_active.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self, nodes: Vec<Node>, edges: Vec<Edge>) -> Result<ExecutionStats> {
        let execution_id = format!("exec-{}", Uuid::new_v4());

        // Validation happens before on_start fires.
        let report = GraphAnalyzer::analyze(&nodes, &edges);
        let mut problems = report.errors;
        for node in &nodes {
            if !self.registry.contains(&node.node_type) {
                problems.push(
                    ExecutionError::validation(format!(
                        "no handler registered for node type '{}'",
                        node.node_type
                    ))
                    .with_node(&node.id),
                );
            }
        }
        problems.extend(self.transfer.validate_edges(&nodes, &edges));
        if !report.valid || !problems.is_empty() {
            let error = ExecutionError::validation(crate::error::summarize(&problems))
                .with_details(serde_json::json!({"cycles": report.cycles}));
            self.fire_error(&error);
            return Err(error.into());
        }
        let plan = report.plan.expect("valid analysis carries a plan");

        info!(
            execution_id = %execution_id,
            nodes = plan.total_nodes,
            layers = plan.layers.len(),
            "starting workflow run"
        );
        self.prepare_run(&execution_id, &nodes, &edges, &plan).await;

        self.state.mark_run_started().await;
        if let Some(cb) = self.callbacks.read().on_start.clone() {
            cb(&execution_id);
        }
        self.emit(EngineEvent::RunStarted {
            execution_id: execution_id.clone(),
            at_ms: self.now_ms(),
            total_nodes: plan.total_nodes,
        });
        self.state.start_history(self.config.history_interval);

        // Fallback targets stay dormant until their origin fails.
        let dormant = self.recovery.fallback_targets();
        for (level, layer) in plan.layers.iter().enumerate() {
            for node_id in layer {
                if dormant.contains(node_id) {
                    continue;
                }
                let _ = self.queue.enqueue(node_id, level, None).await;
            }
        }
        self.queue.dispatch().await;

        let outcome = self.drive(&execution_id).await;

        self.state.stop_history();
        self.state.mark_run_finished().await;

        match outcome {
            Ok(()) => {
                let stats = self.state.statistics().await;
                if let Some(cb) = self.callbacks.read().on_complete.clone() {
                    cb(&stats);
                }
                self.emit(EngineEvent::RunCompleted {
                    execution_id: execution_id.clone(),
                    at_ms: self.now_ms(),
                    stats: stats.clone(),
                });
                info!(execution_id = %execution_id, "workflow run completed");
                Ok(stats)
            }
            Err(error) => {
                self.emit(EngineEvent::RunFailed {
                    execution_id: execution_id.clone(),
                    at_ms: self.now_ms(),
                    message: error.to_string(),
                });
                warn!(execution_id = %execution_id, error = %error, "workflow run aborted");
                Err(error)
            }
        }
    }

    async fn prepare_run(
        &self,
        execution_id: &str,
        nodes: &[Node],
        edges: &[Edge],
        plan: &ExecutionPlan,
    ) {
        self.state
            .begin_run(execution_id, nodes.to_vec(), edges.to_vec())
            .await;
        self.transfer.reset();
        self.recovery.reset_for_run();

        let mut by_source: HashMap<String, Vec<Edge>> = HashMap::new();
        for edge in edges {
            by_source.entry(edge.source.clone()).or_default().push(edge.clone());
        }
        *self.edges_by_source.write() = by_source;

        let dependencies: HashMap<String, Vec<String>> = plan
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.dependencies.to_vec()))
            .collect();
        let exec_ctx = ExecutorContext::new(execution_id, self.hosts.clone())
            .with_script_timeout(self.config.script_timeout);
        self.queue.begin_run(exec_ctx, dependencies);

        // Drop any signals left over from an aborted previous run.
        let mut signals = self.signals.lock().await;
        while signals.try_recv().is_ok() {}
    }

    /// Event loop: react to queue signals until the run terminates
    async fn drive(&self, execution_id: &str) -> std::result::Result<(), NodeFlowError> {
        let mut signals = self.signals.lock().await;
        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                return Err(ExecutionError::runtime("run stopped").into());
            }
            if self.is_terminated().await {
                return Ok(());
            }

            // Completion is signal-driven; the timeout is only a fallback so
            // stop requests are honored even during a quiet retry window.
            let signal =
                match tokio::time::timeout(Duration::from_millis(100), signals.recv()).await {
                    Ok(Some(signal)) => signal,
                    Ok(None) => {
                        return Err(NodeFlowError::Internal(
                            "queue signal channel closed".to_string(),
                        ));
                    }
                    Err(_) => continue,
                };
            match signal {
                QueueSignal::Started { node_id } => {
                    if let Some(cb) = self.callbacks.read().on_node_start.clone() {
                        cb(&node_id);
                    }
                    self.emit(EngineEvent::NodeStarted {
                        execution_id: execution_id.to_string(),
                        at_ms: self.now_ms(),
                        node_id,
                    });
                }
                QueueSignal::Finished { node_id, outcome } => match outcome {
                    Ok(output) => {
                        self.on_node_completed(execution_id, &node_id, output).await?;
                    }
                    Err(error) => {
                        self.on_node_failed(execution_id, &node_id, error).await?;
                    }
                },
                QueueSignal::Cancelled { .. } => {
                    self.queue.dispatch().await;
                }
            }
        }
    }

    async fn on_node_completed(
        &self,
        execution_id: &str,
        node_id: &str,
        output: Value,
    ) -> std::result::Result<(), NodeFlowError> {
        debug!(node_id, "node completed");
        if let Some(cb) = self.callbacks.read().on_node_complete.clone() {
            cb(node_id, &output);
        }
        self.emit(EngineEvent::NodeCompleted {
            execution_id: execution_id.to_string(),
            at_ms: self.now_ms(),
            node_id: node_id.to_string(),
            output,
        });

        self.fan_out(node_id).await?;
        self.fire_progress(execution_id).await;
        self.queue.dispatch().await;
        Ok(())
    }

    /// Transfer the completed node's output along every outgoing edge
    fn fan_out<'a>(
        &'a self,
        node_id: &'a str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<(), NodeFlowError>> + Send + 'a>,
    > {
        Box::pin(self.fan_out_inner(node_id))
    }

    async fn fan_out_inner(&self, node_id: &str) -> std::result::Result<(), NodeFlowError> {
        let outgoing: Vec<Edge> = self
            .edges_by_source
            .read()
            .get(node_id)
            .cloned()
            .unwrap_or_default();
        if outgoing.is_empty() {
            return Ok(());
        }

        let results = join_all(outgoing.iter().map(|edge| self.transfer.transfer(edge))).await;
        for (edge, result) in outgoing.iter().zip(results) {
            if let Err(error) = result {
                let error = if error.node_id.is_none() {
                    ExecutionError {
                        kind: ErrorKind::Runtime,
                        node_id: Some(edge.source.clone()),
                        ..error
                    }
                } else {
                    error
                };
                warn!(edge_id = %edge.id, error = %error, "transfer failed");
                if !self.config.recovery_enabled {
                    self.fire_error(&error);
                    self.queue.cancel(None).await;
                    return Err(error.into());
                }
                let decision = self.recovery.handle(error.clone()).await;
                self.apply_decision(&error, decision).await?;
            }
        }
        Ok(())
    }

    async fn on_node_failed(
        &self,
        execution_id: &str,
        node_id: &str,
        error: ExecutionError,
    ) -> std::result::Result<(), NodeFlowError> {
        if let Some(cb) = self.callbacks.read().on_node_error.clone() {
            cb(node_id, &error.message);
        }
        self.emit(EngineEvent::NodeFailed {
            execution_id: execution_id.to_string(),
            at_ms: self.now_ms(),
            node_id: node_id.to_string(),
            message: error.message.clone(),
        });

        if !self.config.recovery_enabled {
            self.fire_error(&error);
            self.queue.cancel(None).await;
            return Err(error.into());
        }

        let decision = self.recovery.handle(error.clone()).await;
        self.apply_decision(&error, decision).await?;
        self.fire_progress(execution_id).await;
        self.queue.dispatch().await;
        Ok(())
    }

    /// Translate a recovery decision into queue operations
    async fn apply_decision(
        &self,
        error: &ExecutionError,
        decision: RecoveryDecision,
    ) -> std::result::Result<(), NodeFlowError> {
        match decision.action {
            RecoveryAction::Retry => {
                if let Some(node_id) = &error.node_id {
                    for edge in self
                        .edges_by_source
                        .read()
                        .get(node_id)
                        .map(|edges| edges.as_slice())
                        .unwrap_or(&[])
                    {
                        self.transfer.invalidate(&edge.id);
                    }
                    let delay = decision.retry_delay.unwrap_or_default();
                    info!(node_id = %node_id, ?delay, "scheduling retry");
                    self.queue.schedule_retry(node_id, delay);
                }
                Ok(())
            }
            RecoveryAction::Fallback => {
                if let Some(fallback_id) = &decision.fallback_node_id {
                    info!(fallback = %fallback_id, "enqueueing fallback node");
                    let _ = self.queue.enqueue(fallback_id, 0, Some(1000)).await;
                    self.queue.dispatch().await;
                }
                Ok(())
            }
            RecoveryAction::Skip => {
                // The handler already completed the node with the sentinel;
                // its downstreams still need the sentinel transferred.
                if let Some(node_id) = &error.node_id {
                    debug!(node_id = %node_id, "node skipped");
                    self.fan_out(node_id).await?;
                }
                Ok(())
            }
            RecoveryAction::Stop => {
                self.fire_error(error);
                self.queue.cancel(None).await;
                Err(ExecutionError {
                    kind: error.kind,
                    node_id: error.node_id.clone(),
                    message: decision.message,
                    timestamp: error.timestamp,
                    details: error.details.clone(),
                }
                .into())
            }
        }
    }

    async fn fire_progress(&self, execution_id: &str) {
        let progress = self.state.progress().await;
        if let Some(cb) = self.callbacks.read().on_progress.clone() {
            cb(&progress);
        }
        self.emit(EngineEvent::Progress {
            execution_id: execution_id.to_string(),
            at_ms: self.now_ms(),
            progress,
        });
    }

    fn fire_error(&self, error: &ExecutionError) {
        if let Some(cb) = self.callbacks.read().on_error.clone() {
            cb(error);
        }
    }

    /// The run terminates when nothing is running, no retry timer is armed,
    /// and no pending node has all dependencies completed
    async fn is_terminated(&self) -> bool {
        self.queue.running_count() == 0
            && self.queue.scheduled_count() == 0
            && !self.queue.has_ready().await
    }

    /// Request the current run to stop; in-flight work is cancelled
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.queue.cancel(None).await;
    }

    /// Cancel a single node
    pub async fn cancel_node(&self, node_id: &str) {
        self.queue.cancel(Some(node_id)).await;
    }

    /// Structural copy of the current execution context
    pub async fn state(&self) -> RunContext {
        self.state.snapshot().await
    }

    /// Aggregated progress of the current run
    pub async fn progress(&self) -> Progress {
        self.state.progress().await
    }

    /// Export the execution state as a JSON document
    pub async fn export_state(&self) -> Result<String> {
        let context = self.state.snapshot().await;
        let stats = self.state.statistics().await;
        let document = serde_json::json!({
            "execution_id": context.execution_id,
            "timestamp": Utc::now().to_rfc3339(),
            "nodes": context.nodes,
            "edges": context.edges,
            "node_states": context.node_states,
            "global_data": context.global_data,
            "statistics": stats,
            "errors": self.recovery.errors(),
        });
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Import a previously exported state document
    ///
    /// The document is fully validated before the context is replaced; an
    /// invalid document leaves the engine untouched.
    pub async fn import_state(&self, document: &str) -> Result<()> {
        if self.run_active.load(Ordering::SeqCst) {
            return Err(ExecutionError::runtime("cannot import state during a run").into());
        }
        let value: Value = serde_json::from_str(document)?;
        let object = value
            .as_object()
            .ok_or_else(|| ExecutionError::validation("state document must be an object"))?;
        for field in ["execution_id", "nodes", "edges", "node_states", "global_data"] {
            if !object.contains_key(field) {
                return Err(ExecutionError::validation(format!(
                    "state document missing field '{}'",
                    field
                ))
                .into());
            }
        }

        let execution_id: String = serde_json::from_value(object["execution_id"].clone())?;
        let nodes: Vec<Node> = serde_json::from_value(object["nodes"].clone())?;
        let edges: Vec<Edge> = serde_json::from_value(object["edges"].clone())?;
        let node_states: HashMap<String, NodeState> =
            serde_json::from_value(object["node_states"].clone())?;
        let global_data: HashMap<String, Value> =
            serde_json::from_value(object["global_data"].clone())?;

        let mut context = RunContext::new(execution_id.as_str(), nodes, edges);
        context.node_states = node_states;
        context.global_data = global_data;
        self.state.restore(context).await;
        Ok(())
    }

    /// Stop any run and drop listeners and subscribers
    pub async fn dispose(&self) {
        self.stop().await;
        self.state.stop_history();
        self.state.clear_listeners();
        self.subscribers.lock().clear();
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeStatus;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_empty_graph_completes_immediately() {
        let engine = WorkflowEngine::new();
        let stats = engine.run(Vec::new(), Vec::new()).await.unwrap();
        assert_eq!(stats.total_nodes, 0);
        assert_eq!(stats.completed, 0);
        assert!(engine.errors().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_start() {
        let engine = WorkflowEngine::new();
        let started = Arc::new(AtomicUsize::new(0));
        let started_probe = started.clone();
        engine.set_callbacks(WorkflowCallbacks::new().on_start(move |_| {
            started_probe.fetch_add(1, Ordering::SeqCst);
        }));

        let nodes = vec![
            Node::bare("a", "memo"),
            Node::bare("b", "memo"),
        ];
        let edges = vec![Edge::new("e1", "a", "b"), Edge::new("e2", "b", "a")];
        let result = engine.run(nodes, edges).await;

        assert!(result.is_err());
        assert_eq!(started.load(Ordering::SeqCst), 0);
        // No state transitions happened.
        let context = engine.state().await;
        assert!(context.node_states.is_empty() || context.execution_id.is_empty());
    }

    #[tokio::test]
    async fn test_single_memo_runs_to_completion() {
        let engine = WorkflowEngine::new();
        let nodes = vec![Node::new("m", "memo", json!({"content": "note"}))];
        let stats = engine.run(nodes, Vec::new()).await.unwrap();
        assert_eq!(stats.completed, 1);

        let state = engine.state_manager().get("m").await.unwrap();
        assert_eq!(state.status, NodeStatus::Completed);
        assert_eq!(state.output.as_ref().unwrap()["content"], "note");
    }

    #[tokio::test]
    async fn test_unknown_node_type_rejects_run() {
        let engine = WorkflowEngine::new();
        let result = engine.run(vec![Node::bare("x", "warp-drive")], Vec::new()).await;
        match result {
            Err(NodeFlowError::Execution(error)) => {
                assert_eq!(error.kind, ErrorKind::Validation);
                assert!(error.message.contains("warp-drive"));
            }
            other => panic!("expected validation failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let engine = WorkflowEngine::new();
        let nodes = vec![Node::new("m", "memo", json!({"content": "x"}))];
        engine.run(nodes, Vec::new()).await.unwrap();

        let document = engine.export_state().await.unwrap();
        let engine2 = WorkflowEngine::new();
        engine2.import_state(&document).await.unwrap();

        let context = engine2.state().await;
        assert_eq!(context.node_states["m"].status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_dispose_drops_subscribers() {
        let engine = WorkflowEngine::new();
        let mut events = engine.events();
        engine.dispose().await;
        // The sender side is gone, so the stream ends.
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_import_rejects_invalid_document() {
        let engine = WorkflowEngine::new();
        assert!(engine.import_state("not json").await.is_err());
        assert!(engine.import_state("{\"execution_id\": \"x\"}").await.is_err());
        // Context untouched after rejections.
        assert_eq!(engine.state().await.execution_id, "");
    }
}
