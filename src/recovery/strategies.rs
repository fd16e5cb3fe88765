//! Built-in recovery strategies
//!
//! Strategies are evaluated in priority order by the
//! [`ErrorHandler`](crate::recovery::ErrorHandler). Each strategy owns any
//! per-run counters it needs; counters are never shared across strategies.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ExecutionError};
use crate::recovery::{RecoveryAction, RecoveryDecision};

/// Failing-node context handed to strategies
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    /// Id of the failing node, when attributable
    pub node_id: Option<&'a str>,

    /// Type tag of the failing node, when known
    pub node_type: Option<&'a str>,
}

/// One link in the recovery chain
pub trait RecoveryStrategy: Send + Sync {
    /// Strategy name for logs and statistics
    fn name(&self) -> &'static str;

    /// Whether this strategy wants to handle the error
    fn applies(&self, error: &ExecutionError, ctx: &StrategyContext<'_>) -> bool;

    /// Produce the recovery decision; only called when `applies` returned true
    fn decide(&self, error: &ExecutionError, ctx: &StrategyContext<'_>) -> RecoveryDecision;
}

/// Exponential backoff configuration for retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Backoff multiplier applied per attempt
    pub multiplier: f64,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Retries allowed per node
    pub max_retries: u32,

    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 3,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for the given 0-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let bounded = scaled.min(self.max_delay.as_millis() as f64);
        let with_jitter = if self.jitter {
            bounded + bounded * rand::thread_rng().gen_range(0.0..0.1)
        } else {
            bounded
        };
        Duration::from_millis(with_jitter as u64)
    }
}

/// Aborts the run for critical error kinds
pub struct StopStrategy {
    critical: HashSet<ErrorKind>,
}

impl StopStrategy {
    /// Stop on the given kinds
    pub fn new(critical: HashSet<ErrorKind>) -> Self {
        Self { critical }
    }
}

impl Default for StopStrategy {
    fn default() -> Self {
        Self::new(HashSet::from([
            ErrorKind::Validation,
            ErrorKind::Security,
            ErrorKind::Fatal,
        ]))
    }
}

impl RecoveryStrategy for StopStrategy {
    fn name(&self) -> &'static str {
        "stop"
    }

    fn applies(&self, error: &ExecutionError, _ctx: &StrategyContext<'_>) -> bool {
        self.critical.contains(&error.kind)
    }

    fn decide(&self, error: &ExecutionError, _ctx: &StrategyContext<'_>) -> RecoveryDecision {
        RecoveryDecision {
            action: RecoveryAction::Stop,
            message: format!("critical {} error: {}", error.kind, error.message),
            retry_delay: None,
            fallback_node_id: None,
        }
    }
}

/// Re-runs a node with exponential backoff for transient error kinds
pub struct RetryStrategy {
    policy: RetryPolicy,
    retryable: HashSet<ErrorKind>,
    counters: DashMap<String, u32>,
}

impl RetryStrategy {
    /// Retry the given kinds under the given policy
    pub fn new(policy: RetryPolicy, retryable: HashSet<ErrorKind>) -> Self {
        Self {
            policy,
            retryable,
            counters: DashMap::new(),
        }
    }

    /// Retries already consumed by a node
    pub fn retry_count(&self, node_id: &str) -> u32 {
        self.counters.get(node_id).map(|entry| *entry.value()).unwrap_or(0)
    }

    /// Clear all per-node counters
    pub fn reset_counters(&self) {
        self.counters.clear();
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(
            RetryPolicy::default(),
            HashSet::from([ErrorKind::Timeout, ErrorKind::Network, ErrorKind::Temporary]),
        )
    }
}

impl RecoveryStrategy for RetryStrategy {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn applies(&self, error: &ExecutionError, ctx: &StrategyContext<'_>) -> bool {
        let Some(node_id) = ctx.node_id else {
            return false;
        };
        self.retryable.contains(&error.kind) && self.retry_count(node_id) < self.policy.max_retries
    }

    fn decide(&self, error: &ExecutionError, ctx: &StrategyContext<'_>) -> RecoveryDecision {
        let node_id = ctx.node_id.expect("applies checked node id");
        let attempt = {
            let mut counter = self.counters.entry(node_id.to_string()).or_insert(0);
            let attempt = *counter;
            *counter += 1;
            attempt
        };
        let delay = self.policy.delay_for(attempt);
        RecoveryDecision {
            action: RecoveryAction::Retry,
            message: format!(
                "retrying after {} error (attempt {} of {})",
                error.kind,
                attempt + 1,
                self.policy.max_retries
            ),
            retry_delay: Some(delay),
            fallback_node_id: None,
        }
    }
}

/// Redirects to a pre-registered fallback node
///
/// Never fires twice for the same originating node, so fallback chains
/// cannot loop back through their origin.
pub struct FallbackStrategy {
    fallbacks: DashMap<String, String>,
    fired: DashSet<String>,
}

impl FallbackStrategy {
    /// Empty fallback registry
    pub fn new() -> Self {
        Self {
            fallbacks: DashMap::new(),
            fired: DashSet::new(),
        }
    }

    /// Register a fallback for a node
    pub fn register(&self, node_id: impl Into<String>, fallback_id: impl Into<String>) {
        self.fallbacks.insert(node_id.into(), fallback_id.into());
    }

    /// Registered fallback for a node, if any
    pub fn fallback_of(&self, node_id: &str) -> Option<String> {
        self.fallbacks.get(node_id).map(|entry| entry.value().clone())
    }

    /// Every node id registered as a fallback target
    pub fn targets(&self) -> HashSet<String> {
        self.fallbacks.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Forget which origins already fired
    pub fn reset_fired(&self) {
        self.fired.clear();
    }
}

impl Default for FallbackStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryStrategy for FallbackStrategy {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn applies(&self, _error: &ExecutionError, ctx: &StrategyContext<'_>) -> bool {
        match ctx.node_id {
            Some(node_id) => self.fallbacks.contains_key(node_id) && !self.fired.contains(node_id),
            None => false,
        }
    }

    fn decide(&self, _error: &ExecutionError, ctx: &StrategyContext<'_>) -> RecoveryDecision {
        let node_id = ctx.node_id.expect("applies checked node id");
        self.fired.insert(node_id.to_string());
        let fallback = self.fallback_of(node_id).expect("applies checked registration");
        RecoveryDecision {
            action: RecoveryAction::Fallback,
            message: format!("redirecting '{}' to fallback '{}'", node_id, fallback),
            retry_delay: None,
            fallback_node_id: Some(fallback),
        }
    }
}

/// Treats failures of harmless node types as successful no-ops
pub struct SkipStrategy {
    skippable: HashSet<String>,
}

impl SkipStrategy {
    /// Skip failures of the given node types
    pub fn new(skippable: HashSet<String>) -> Self {
        Self { skippable }
    }
}

impl Default for SkipStrategy {
    fn default() -> Self {
        Self::new(HashSet::from(["memo".to_string(), "connector".to_string()]))
    }
}

impl RecoveryStrategy for SkipStrategy {
    fn name(&self) -> &'static str {
        "skip"
    }

    fn applies(&self, _error: &ExecutionError, ctx: &StrategyContext<'_>) -> bool {
        ctx.node_type.map(|t| self.skippable.contains(t)).unwrap_or(false)
    }

    fn decide(&self, _error: &ExecutionError, ctx: &StrategyContext<'_>) -> RecoveryDecision {
        RecoveryDecision {
            action: RecoveryAction::Skip,
            message: format!(
                "skipping failed {} node",
                ctx.node_type.unwrap_or("unknown")
            ),
            retry_delay: None,
            fallback_node_id: None,
        }
    }
}
