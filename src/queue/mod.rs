//! Bounded-parallelism execution queue
//!
//! A single cooperative dispatcher admits ready nodes (all dependencies
//! completed) up to the configured parallelism bound. Work items run as
//! parallel tokio tasks; admission order is priority descending, then level
//! ascending, stable by insertion sequence. At most one instance of a node
//! runs at any time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::executor::{ExecutorContext, ExecutorRegistry};
use crate::state::{NodeStatePatch, NodeStatus, StateManager};

/// Errors surfaced to queue waiters
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// The awaited node was cancelled before producing a result
    #[error("node '{0}' was cancelled")]
    Cancelled(String),

    /// The awaited node failed
    #[error(transparent)]
    Failed(#[from] ExecutionError),
}

/// Scheduling events delivered to the engine
#[derive(Debug)]
pub enum QueueSignal {
    /// A node transitioned to running
    Started {
        /// Node that started
        node_id: String,
    },

    /// A node resolved with an output or an error
    Finished {
        /// Node that resolved
        node_id: String,
        /// Execution outcome
        outcome: Result<Value, ExecutionError>,
    },

    /// A node was cancelled; any in-flight result is discarded
    Cancelled {
        /// Node that was cancelled
        node_id: String,
    },
}

/// Completion handle returned by [`ExecutionQueue::enqueue`]
pub type CompletionReceiver = oneshot::Receiver<Result<Value, QueueError>>;

struct QueueItem {
    node_id: String,
    level: usize,
    priority: i64,
    seq: u64,
    waiters: Vec<oneshot::Sender<Result<Value, QueueError>>>,
}

impl QueueItem {
    /// Admission order: priority desc, level asc, insertion order
    fn precedes(&self, other: &Self) -> bool {
        if self.priority != other.priority {
            return self.priority > other.priority;
        }
        if self.level != other.level {
            return self.level < other.level;
        }
        self.seq < other.seq
    }
}

type SizeListener = Box<dyn Fn(usize) + Send + Sync>;

struct QueueInner {
    max_parallelism: usize,
    registry: Arc<ExecutorRegistry>,
    state: StateManager,
    pending: parking_lot::Mutex<Vec<QueueItem>>,
    running: parking_lot::Mutex<HashSet<String>>,
    cancelled: dashmap::DashSet<String>,
    dependencies: parking_lot::RwLock<HashMap<String, Vec<String>>>,
    exec_ctx: parking_lot::RwLock<Option<ExecutorContext>>,
    seq: AtomicU64,
    scheduled: AtomicUsize,
    signals: mpsc::UnboundedSender<QueueSignal>,
    dispatch_gate: tokio::sync::Mutex<()>,
    size_listener: parking_lot::RwLock<Option<SizeListener>>,
}

/// Bounded-parallelism scheduler; cheap to clone
pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
}

impl Clone for ExecutionQueue {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl ExecutionQueue {
    /// Create a queue and the signal channel the engine listens on
    pub fn new(
        max_parallelism: usize,
        registry: Arc<ExecutorRegistry>,
        state: StateManager,
    ) -> (Self, mpsc::UnboundedReceiver<QueueSignal>) {
        let (signals, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(QueueInner {
                max_parallelism: max_parallelism.max(1),
                registry,
                state,
                pending: parking_lot::Mutex::new(Vec::new()),
                running: parking_lot::Mutex::new(HashSet::new()),
                cancelled: dashmap::DashSet::new(),
                dependencies: parking_lot::RwLock::new(HashMap::new()),
                exec_ctx: parking_lot::RwLock::new(None),
                seq: AtomicU64::new(0),
                scheduled: AtomicUsize::new(0),
                signals,
                dispatch_gate: tokio::sync::Mutex::new(()),
                size_listener: parking_lot::RwLock::new(None),
            }),
        };
        (queue, receiver)
    }

    /// Reset per-run state and install the executor context and dependencies
    pub fn begin_run(&self, exec_ctx: ExecutorContext, dependencies: HashMap<String, Vec<String>>) {
        self.inner.pending.lock().clear();
        self.inner.running.lock().clear();
        self.inner.cancelled.clear();
        *self.inner.dependencies.write() = dependencies;
        *self.inner.exec_ctx.write() = Some(exec_ctx);
        self.inner.scheduled.store(0, Ordering::SeqCst);
    }

    /// Register a callback fired whenever the pending size changes
    pub fn on_size_change(&self, listener: impl Fn(usize) + Send + Sync + 'static) {
        *self.inner.size_listener.write() = Some(Box::new(listener));
    }

    fn notify_size(&self) {
        let size = self.inner.pending.lock().len();
        if let Some(listener) = self.inner.size_listener.read().as_ref() {
            listener(size);
        }
    }

    /// Pending item count
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Currently running node count
    pub fn running_count(&self) -> usize {
        self.inner.running.lock().len()
    }

    /// Retry timers not yet re-enqueued
    pub fn scheduled_count(&self) -> usize {
        self.inner.scheduled.load(Ordering::SeqCst)
    }

    /// Whether any pending item is currently dispatchable
    pub async fn has_ready(&self) -> bool {
        let statuses = self.inner.state.statuses().await;
        let running = self.inner.running.lock();
        let pending = self.inner.pending.lock();
        let dependencies = self.inner.dependencies.read();
        pending.iter().any(|item| {
            !running.contains(&item.node_id)
                && Self::deps_completed(&dependencies, &statuses, &item.node_id)
        })
    }

    fn deps_completed(
        dependencies: &HashMap<String, Vec<String>>,
        statuses: &HashMap<String, NodeStatus>,
        node_id: &str,
    ) -> bool {
        dependencies
            .get(node_id)
            .map(|deps| {
                deps.iter().all(|dep| statuses.get(dep) == Some(&NodeStatus::Completed))
            })
            .unwrap_or(true)
    }

    /// Default priority: earlier layers first, with per-type adjustments
    async fn derive_priority(&self, node_id: &str, level: usize) -> i64 {
        let base = 100 - level as i64;
        let adjustment = match self.inner.state.node(node_id).await {
            Some(node) => match node.node_type.as_str() {
                "script" => 50,
                "memo" => -10,
                _ => 0,
            },
            None => 0,
        };
        base + adjustment
    }

    /// Enqueue a node at the given layer
    ///
    /// Returns a handle resolved with the node's output, its failure, or a
    /// cancellation error. Enqueueing an already-pending node merges with the
    /// existing entry instead of duplicating it.
    pub async fn enqueue(
        &self,
        node_id: &str,
        level: usize,
        priority: Option<i64>,
    ) -> CompletionReceiver {
        let priority = match priority {
            Some(p) => p,
            None => self.derive_priority(node_id, level).await,
        };
        let (sender, receiver) = oneshot::channel();

        // A re-enqueued node is runnable again.
        self.inner.cancelled.remove(node_id);

        {
            let mut pending = self.inner.pending.lock();
            if let Some(existing) = pending.iter_mut().find(|item| item.node_id == node_id) {
                existing.priority = existing.priority.max(priority);
                existing.waiters.push(sender);
            } else {
                pending.push(QueueItem {
                    node_id: node_id.to_string(),
                    level,
                    priority,
                    seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
                    waiters: vec![sender],
                });
            }
        }
        self.notify_size();
        receiver
    }

    /// Enqueue every node of a layered plan
    pub async fn enqueue_plan(&self, plan: &crate::graph::ExecutionPlan) {
        for (level, layer) in plan.layers.iter().enumerate() {
            for node_id in layer {
                let _ = self.enqueue(node_id, level, None).await;
            }
        }
    }

    /// Re-enqueue a node at top level after a delay
    pub fn schedule_retry(&self, node_id: &str, delay: Duration) {
        let queue = self.clone();
        let node_id = node_id.to_string();
        self.inner.scheduled.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.enqueue(&node_id, 0, Some(0)).await;
            queue.inner.scheduled.fetch_sub(1, Ordering::SeqCst);
            queue.dispatch().await;
        });
    }

    /// Cancel one node, or everything when `node_id` is `None`
    ///
    /// Pending entries are removed and their waiters rejected. A running
    /// instance is marked cancelled; its eventual result is discarded and the
    /// dispatcher does not wait for it to wind down.
    pub async fn cancel(&self, node_id: Option<&str>) {
        let removed: Vec<QueueItem> = {
            let mut pending = self.inner.pending.lock();
            match node_id {
                Some(id) => {
                    let (cancelled, kept): (Vec<QueueItem>, Vec<QueueItem>) =
                        pending.drain(..).partition(|item| item.node_id == id);
                    *pending = kept;
                    cancelled
                }
                None => pending.drain(..).collect(),
            }
        };
        self.notify_size();

        for item in removed {
            self.inner.state
                .update(&item.node_id, NodeStatePatch::new().status(NodeStatus::Cancelled))
                .await;
            for waiter in item.waiters {
                let _ = waiter.send(Err(QueueError::Cancelled(item.node_id.clone())));
            }
            let _ = self.inner.signals.send(QueueSignal::Cancelled {
                node_id: item.node_id,
            });
        }

        let running: Vec<String> = {
            let running = self.inner.running.lock();
            match node_id {
                Some(id) if running.contains(id) => vec![id.to_string()],
                Some(_) => Vec::new(),
                None => running.iter().cloned().collect(),
            }
        };
        for id in running {
            self.inner.cancelled.insert(id.clone());
            self.inner.state
                .update(&id, NodeStatePatch::new().status(NodeStatus::Cancelled))
                .await;
            let _ = self.inner.signals.send(QueueSignal::Cancelled { node_id: id });
        }
    }

    /// Run dispatcher passes until no further item can be admitted
    ///
    /// Only one pass runs at a time; concurrent callers queue on the gate.
    pub async fn dispatch(&self) {
        let _gate = self.inner.dispatch_gate.lock().await;

        loop {
            let statuses = self.inner.state.statuses().await;
            let picked = {
                let mut running = self.inner.running.lock();
                if running.len() >= self.inner.max_parallelism {
                    None
                } else {
                    let mut pending = self.inner.pending.lock();
                    let dependencies = self.inner.dependencies.read();
                    let mut best: Option<usize> = None;
                    for (index, item) in pending.iter().enumerate() {
                        if running.contains(&item.node_id) {
                            continue;
                        }
                        if !Self::deps_completed(&dependencies, &statuses, &item.node_id) {
                            continue;
                        }
                        best = match best {
                            None => Some(index),
                            Some(current) if item.precedes(&pending[current]) => Some(index),
                            Some(current) => Some(current),
                        };
                    }
                    // Removal and running-set insertion are a single atomic
                    // step with respect to other dispatcher passes.
                    best.map(|index| {
                        let item = pending.remove(index);
                        running.insert(item.node_id.clone());
                        item
                    })
                }
            };

            let Some(item) = picked else {
                break;
            };
            self.notify_size();
            self.start_item(item).await;
        }
    }

    async fn start_item(&self, item: QueueItem) {
        let queue = self.clone();
        let QueueItem { node_id, waiters, .. } = item;

        self.inner.state
            .update(
                &node_id,
                NodeStatePatch::new().status(NodeStatus::Running).progress(0),
            )
            .await;
        let _ = self.inner.signals.send(QueueSignal::Started {
            node_id: node_id.clone(),
        });

        let exec_ctx = self.inner.exec_ctx.read().clone();
        tokio::spawn(async move {
            let outcome = queue.execute_node(&node_id, exec_ctx).await;
            queue.resolve_item(node_id, waiters, outcome).await;
        });
    }

    async fn execute_node(
        &self,
        node_id: &str,
        exec_ctx: Option<ExecutorContext>,
    ) -> Result<Value, ExecutionError> {
        let exec_ctx = exec_ctx.ok_or_else(|| {
            ExecutionError::runtime("queue has no executor context; was begin_run called?")
        })?;
        let node = self.inner.state.node(node_id).await.ok_or_else(|| {
            ExecutionError::dependency(format!("node '{}' not in run", node_id)).with_node(node_id)
        })?;
        let inputs = self.inner.state.inputs_of(node_id).await;
        self.inner.registry.execute(&node, &exec_ctx, &inputs).await
    }

    async fn resolve_item(
        &self,
        node_id: String,
        waiters: Vec<oneshot::Sender<Result<Value, QueueError>>>,
        outcome: Result<Value, ExecutionError>,
    ) {
        if self.inner.cancelled.contains(&node_id) {
            // cancel() already transitioned the state; the result is dropped.
            debug!(node_id = %node_id, "discarding result of cancelled node");
            self.inner.running.lock().remove(&node_id);
            for waiter in waiters {
                let _ = waiter.send(Err(QueueError::Cancelled(node_id.clone())));
            }
            let _ = self.inner.signals.send(QueueSignal::Cancelled { node_id });
            return;
        }

        match &outcome {
            Ok(output) => {
                self.inner.state
                    .update(
                        &node_id,
                        NodeStatePatch::new()
                            .status(NodeStatus::Completed)
                            .output(output.clone()),
                    )
                    .await;
            }
            Err(error) => {
                warn!(node_id = %node_id, error = %error, "node execution failed");
                self.inner.state
                    .update(
                        &node_id,
                        NodeStatePatch::new()
                            .status(NodeStatus::Failed)
                            .error(error.message.clone()),
                    )
                    .await;
            }
        }

        // The admission slot frees only after the terminal state is visible.
        self.inner.running.lock().remove(&node_id);
        for waiter in waiters {
            let _ = waiter.send(outcome.clone().map_err(QueueError::from));
        }
        let _ = self.inner.signals.send(QueueSignal::Finished { node_id, outcome });
    }
}
