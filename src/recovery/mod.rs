//! Error recovery
//!
//! An ordered chain of strategies decides what happens when a node or a
//! transfer fails: abort the run, retry with backoff, redirect to a fallback
//! node, or skip. The handler also keeps a bounded log of every error it has
//! seen and applies the decision's state side effects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ErrorKind, ExecutionError};
use crate::executor::skip_sentinel;
use crate::state::{NodeStatePatch, NodeStatus, StateManager};

pub mod strategies;

pub use strategies::{
    FallbackStrategy, RecoveryStrategy, RetryPolicy, RetryStrategy, SkipStrategy, StopStrategy,
    StrategyContext,
};

/// What the engine should do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-enqueue the failing node after a delay
    Retry,
    /// Treat the failure as a successful no-op
    Skip,
    /// Enqueue the registered fallback node
    Fallback,
    /// Abort the run
    Stop,
}

/// Outcome of dispatching one error through the chain
#[derive(Debug, Clone)]
pub struct RecoveryDecision {
    /// Chosen action
    pub action: RecoveryAction,

    /// Human-readable reason
    pub message: String,

    /// Backoff before re-enqueueing, for `Retry`
    pub retry_delay: Option<Duration>,

    /// Node to enqueue instead, for `Fallback`
    pub fallback_node_id: Option<String>,
}

/// Error-log statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorStats {
    /// Errors currently held in the log
    pub total: usize,

    /// Count per error kind
    pub by_kind: HashMap<String, usize>,

    /// Count per attributed node
    pub by_node: HashMap<String, usize>,

    /// The ten most recent errors
    pub recent: Vec<ExecutionError>,
}

/// Configuration for the recovery chain
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Kinds that abort the run immediately
    pub critical_kinds: HashSet<ErrorKind>,

    /// Kinds eligible for retry
    pub retryable_kinds: HashSet<ErrorKind>,

    /// Node types whose failure may be skipped
    pub skippable_types: HashSet<String>,

    /// Backoff policy for retries
    pub retry: RetryPolicy,

    /// Bound on the error log, FIFO eviction
    pub log_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            critical_kinds: HashSet::from([
                ErrorKind::Validation,
                ErrorKind::Security,
                ErrorKind::Fatal,
            ]),
            retryable_kinds: HashSet::from([
                ErrorKind::Timeout,
                ErrorKind::Network,
                ErrorKind::Temporary,
            ]),
            skippable_types: HashSet::from(["memo".to_string(), "connector".to_string()]),
            retry: RetryPolicy::default(),
            log_capacity: 1000,
        }
    }
}

/// Ordered strategy chain plus the bounded error log
pub struct ErrorHandler {
    state: StateManager,
    retry: Arc<RetryStrategy>,
    fallback: Arc<FallbackStrategy>,
    chain: Vec<Arc<dyn RecoveryStrategy>>,
    log: parking_lot::Mutex<VecDeque<ExecutionError>>,
    log_capacity: usize,
}

impl ErrorHandler {
    /// Build the default chain: stop, retry, fallback, skip
    pub fn new(state: StateManager, config: RecoveryConfig) -> Self {
        let stop = Arc::new(StopStrategy::new(config.critical_kinds));
        let retry = Arc::new(RetryStrategy::new(config.retry, config.retryable_kinds));
        let fallback = Arc::new(FallbackStrategy::new());
        let skip = Arc::new(SkipStrategy::new(config.skippable_types));

        let chain: Vec<Arc<dyn RecoveryStrategy>> =
            vec![stop, retry.clone(), fallback.clone(), skip];

        Self {
            state,
            retry,
            fallback,
            chain,
            log: parking_lot::Mutex::new(VecDeque::new()),
            log_capacity: config.log_capacity,
        }
    }

    /// Register a fallback node for a potential failure
    pub fn register_fallback(&self, node_id: impl Into<String>, fallback_id: impl Into<String>) {
        self.fallback.register(node_id, fallback_id);
    }

    /// Retries consumed by a node so far
    pub fn retry_count(&self, node_id: &str) -> u32 {
        self.retry.retry_count(node_id)
    }

    /// Node ids registered as fallback targets
    ///
    /// Fallback nodes stay dormant until their origin fails, so the engine
    /// keeps them out of the initial plan enqueue.
    pub fn fallback_targets(&self) -> HashSet<String> {
        self.fallback.targets()
    }

    /// Clear per-run strategy state (counters, fired fallbacks)
    pub fn reset_for_run(&self) {
        self.retry.reset_counters();
        self.fallback.reset_fired();
    }

    /// Dispatch an error through the chain and apply the decision
    ///
    /// The decision's node-state side effects are applied before returning:
    /// retry resets the node to pending, skip completes it with the skip
    /// sentinel, fallback resets the fallback node, stop leaves it failed.
    pub async fn handle(&self, error: ExecutionError) -> RecoveryDecision {
        self.append_log(error.clone());

        let node_type = match &error.node_id {
            Some(id) => self.state.node(id).await.map(|n| n.node_type),
            None => None,
        };
        let ctx = StrategyContext {
            node_id: error.node_id.as_deref(),
            node_type: node_type.as_deref(),
        };

        let decision = self
            .chain
            .iter()
            .find(|strategy| strategy.applies(&error, &ctx))
            .map(|strategy| {
                info!(strategy = strategy.name(), node = ?error.node_id, "recovery strategy selected");
                strategy.decide(&error, &ctx)
            })
            .unwrap_or_else(|| {
                warn!(node = ?error.node_id, kind = %error.kind, "no recovery strategy applies");
                RecoveryDecision {
                    action: RecoveryAction::Stop,
                    message: format!("unhandled {} error: {}", error.kind, error.message),
                    retry_delay: None,
                    fallback_node_id: None,
                }
            });

        self.apply(&error, &decision).await;
        decision
    }

    async fn apply(&self, error: &ExecutionError, decision: &RecoveryDecision) {
        let node_id = error.node_id.as_deref();
        match decision.action {
            RecoveryAction::Retry => {
                if let Some(id) = node_id {
                    self.state
                        .update(id, NodeStatePatch::new().reset().status(NodeStatus::Pending))
                        .await;
                }
            }
            RecoveryAction::Skip => {
                if let Some(id) = node_id {
                    self.state
                        .update(
                            id,
                            NodeStatePatch::new()
                                .reset()
                                .status(NodeStatus::Completed)
                                .output(skip_sentinel()),
                        )
                        .await;
                }
            }
            RecoveryAction::Fallback => {
                if let Some(fallback_id) = &decision.fallback_node_id {
                    self.state
                        .update(
                            fallback_id,
                            NodeStatePatch::new().reset().status(NodeStatus::Pending),
                        )
                        .await;
                }
            }
            RecoveryAction::Stop => {
                if let Some(id) = node_id {
                    self.state
                        .update(
                            id,
                            NodeStatePatch::new()
                                .status(NodeStatus::Failed)
                                .error(error.message.clone()),
                        )
                        .await;
                }
            }
        }
    }

    fn append_log(&self, error: ExecutionError) {
        let mut log = self.log.lock();
        if log.len() >= self.log_capacity {
            log.pop_front();
        }
        log.push_back(error);
    }

    /// All logged errors, oldest first
    pub fn errors(&self) -> Vec<ExecutionError> {
        self.log.lock().iter().cloned().collect()
    }

    /// Aggregate statistics over the logged errors
    pub fn statistics(&self) -> ErrorStats {
        let log = self.log.lock();
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        let mut by_node: HashMap<String, usize> = HashMap::new();
        for error in log.iter() {
            *by_kind.entry(error.kind.to_string()).or_insert(0) += 1;
            if let Some(node) = &error.node_id {
                *by_node.entry(node.clone()).or_insert(0) += 1;
            }
        }
        let recent: Vec<ExecutionError> = log.iter().rev().take(10).rev().cloned().collect();
        ErrorStats {
            total: log.len(),
            by_kind,
            by_node,
            recent,
        }
    }
}
