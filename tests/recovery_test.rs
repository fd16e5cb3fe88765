//! Error recovery scenarios: retry, fallback, skip, stop

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;

use nodeflow::engine::{EngineConfig, WorkflowCallbacks, WorkflowEngine};
use nodeflow::error::{ErrorKind, ExecutionError};
use nodeflow::executor::{ExecutorContext, InputMap, NodeExecutor};
use nodeflow::graph::{Edge, Node};
use nodeflow::host::{
    HostServices, MemoryFileReader, ScriptOutput, ScriptRequest, ScriptRunner, TokioClock,
};
use nodeflow::state::NodeStatus;

/// Fails the first `failures` invocations with a timeout, then succeeds
struct FlakyRunner {
    calls: parking_lot::Mutex<Vec<Instant>>,
    failures: usize,
}

#[async_trait]
impl ScriptRunner for FlakyRunner {
    async fn run(&self, _request: ScriptRequest) -> Result<ScriptOutput, ExecutionError> {
        let attempt = {
            let mut calls = self.calls.lock();
            calls.push(Instant::now());
            calls.len()
        };
        if attempt <= self.failures {
            Err(ExecutionError::timeout("script exceeded its budget"))
        } else {
            Ok(ScriptOutput {
                stdout: "recovered".to_string(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }
}

/// Fails any script whose source mentions "boom"
struct SelectiveRunner;

#[async_trait]
impl ScriptRunner for SelectiveRunner {
    async fn run(&self, request: ScriptRequest) -> Result<ScriptOutput, ExecutionError> {
        if request.source.contains("boom") {
            Err(ExecutionError::runtime("script crashed"))
        } else {
            Ok(ScriptOutput {
                stdout: "fallback-ok".to_string(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }
}

/// Executor that always fails with the given kind
struct FailingExecutor(ErrorKind);

#[async_trait]
impl NodeExecutor for FailingExecutor {
    async fn execute(
        &self,
        _node: &Node,
        _ctx: &ExecutorContext,
        _inputs: &InputMap,
    ) -> Result<serde_json::Value, ExecutionError> {
        Err(ExecutionError::new(self.0, "deliberate failure"))
    }
}

fn hosts_with_runner(runner: Arc<dyn ScriptRunner>) -> Arc<HostServices> {
    Arc::new(HostServices::new(
        runner,
        Arc::new(MemoryFileReader::new()),
        Arc::new(TokioClock::new()),
    ))
}

fn script_node(id: &str, source: &str) -> Node {
    Node::new(id, "script", json!({"script": source, "language": "python"}))
}

#[tokio::test]
async fn retry_then_succeed_with_default_backoff() {
    let runner = Arc::new(FlakyRunner {
        calls: parking_lot::Mutex::new(Vec::new()),
        failures: 1,
    });
    let engine = WorkflowEngine::with_hosts(
        EngineConfig::default(),
        hosts_with_runner(runner.clone()),
    );

    let stats = engine
        .run(vec![script_node("X", "sometimes_slow()")], Vec::new())
        .await
        .unwrap();

    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(
        engine.state_manager().status_of("X").await,
        Some(NodeStatus::Completed)
    );

    // Two invocations separated by at least the initial backoff delay.
    let calls = runner.calls.lock();
    assert_eq!(calls.len(), 2);
    assert!(
        calls[1] - calls[0] >= Duration::from_millis(1000),
        "retry fired too early: {:?}",
        calls[1] - calls[0]
    );

    // One timeout in the log; one retry consumed at success.
    let errors = engine.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::Timeout);
    assert_eq!(engine.retry_count("X"), 1);
}

#[tokio::test]
async fn fallback_runs_and_feeds_downstream() {
    let engine = WorkflowEngine::with_hosts(
        EngineConfig::default(),
        hosts_with_runner(Arc::new(SelectiveRunner)),
    );
    engine.register_fallback("X", "X-alt");

    let nodes = vec![
        script_node("X", "boom()"),
        script_node("X-alt", "rescue()"),
        Node::bare("D", "connector"),
    ];
    // Downstream wiring goes through the fallback; the author owns this.
    let edges = vec![Edge::new("e1", "X-alt", "D")];

    let stats = engine.run(nodes, edges).await.unwrap();

    let manager = engine.state_manager();
    assert_eq!(manager.status_of("X").await, Some(NodeStatus::Failed));
    assert_eq!(manager.status_of("X-alt").await, Some(NodeStatus::Completed));
    assert_eq!(manager.status_of("D").await, Some(NodeStatus::Completed));
    assert_eq!(
        manager.inputs_of("D").await.get("input"),
        Some(&json!("fallback-ok"))
    );
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn fallback_is_dormant_when_origin_succeeds() {
    let engine = WorkflowEngine::with_hosts(
        EngineConfig::default(),
        hosts_with_runner(Arc::new(SelectiveRunner)),
    );
    engine.register_fallback("X", "X-alt");

    let nodes = vec![script_node("X", "fine()"), script_node("X-alt", "rescue()")];
    let stats = engine.run(nodes, Vec::new()).await.unwrap();

    let manager = engine.state_manager();
    assert_eq!(manager.status_of("X").await, Some(NodeStatus::Completed));
    // Never enqueued, never run.
    assert_eq!(manager.status_of("X-alt").await, Some(NodeStatus::Pending));
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn failing_fallback_does_not_loop() {
    let engine = WorkflowEngine::with_hosts(
        EngineConfig::default(),
        hosts_with_runner(Arc::new(SelectiveRunner)),
    );
    engine.register_fallback("X", "X-alt");

    let nodes = vec![script_node("X", "boom()"), script_node("X-alt", "boom() too")];
    let result = engine.run(nodes, Vec::new()).await;

    // The fallback's own failure finds no applicable strategy and aborts.
    assert!(result.is_err());
    let manager = engine.state_manager();
    assert_eq!(manager.status_of("X").await, Some(NodeStatus::Failed));
    assert_eq!(manager.status_of("X-alt").await, Some(NodeStatus::Failed));
}

#[tokio::test]
async fn skip_propagates_sentinel_downstream() {
    let engine = WorkflowEngine::new();
    // A memo that fails at runtime; memo is skippable by default.
    engine.register_executor("memo", Arc::new(FailingExecutor(ErrorKind::Runtime)));

    let nodes = vec![Node::new("M", "memo", json!({"content": "x"})), Node::bare("C", "connector")];
    let edges = vec![Edge::new("e1", "M", "C")];

    let stats = engine.run(nodes, edges).await.unwrap();

    let manager = engine.state_manager();
    let memo_state = manager.get("M").await.unwrap();
    assert_eq!(memo_state.status, NodeStatus::Completed);
    assert_eq!(memo_state.output, Some(json!({"skipped": true})));
    assert_eq!(
        manager.inputs_of("C").await.get("input"),
        Some(&json!({"skipped": true}))
    );
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn critical_error_stops_the_run() {
    let engine = WorkflowEngine::new();
    engine.register_executor("vault", Arc::new(FailingExecutor(ErrorKind::Security)));

    let errors_seen = Arc::new(parking_lot::Mutex::new(Vec::<ErrorKind>::new()));
    let probe = errors_seen.clone();
    engine.set_callbacks(WorkflowCallbacks::new().on_error(move |error| {
        probe.lock().push(error.kind);
    }));

    let nodes = vec![Node::bare("V", "vault"), Node::bare("after", "connector")];
    let edges = vec![Edge::new("e1", "V", "after")];
    let result = engine.run(nodes, edges).await;

    assert!(result.is_err());
    assert_eq!(*errors_seen.lock(), vec![ErrorKind::Security]);
    let manager = engine.state_manager();
    assert_eq!(manager.status_of("V").await, Some(NodeStatus::Failed));
    // Downstream never ran.
    assert_ne!(manager.status_of("after").await, Some(NodeStatus::Completed));
}

#[tokio::test]
async fn disabled_recovery_rejects_on_first_failure() {
    let config = EngineConfig {
        recovery_enabled: false,
        ..EngineConfig::default()
    };
    let engine = WorkflowEngine::with_hosts(config, hosts_with_runner(Arc::new(SelectiveRunner)));

    let failures = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    let probe = failures.clone();
    engine.set_callbacks(WorkflowCallbacks::new().on_node_error(move |node_id, _message| {
        probe.lock().push(node_id.to_string());
    }));

    let result = engine.run(vec![script_node("X", "boom()")], Vec::new()).await;

    assert!(result.is_err());
    assert_eq!(*failures.lock(), vec!["X"]);
    assert_eq!(
        engine.state_manager().status_of("X").await,
        Some(NodeStatus::Failed)
    );
}
