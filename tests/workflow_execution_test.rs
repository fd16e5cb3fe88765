//! End-to-end execution scenarios against the public engine API

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_test::assert_ok;

use nodeflow::engine::{EngineConfig, WorkflowCallbacks, WorkflowEngine};
use nodeflow::error::ExecutionError;
use nodeflow::graph::{Edge, Node};
use nodeflow::host::{
    HostServices, MemoryFileReader, ScriptOutput, ScriptRequest, ScriptRunner, TokioClock,
};
use nodeflow::state::NodeStatus;

/// Script runner that sleeps briefly and tracks peak concurrency
struct SlowRunner {
    active: AtomicI64,
    peak: Arc<AtomicI64>,
    delay: Duration,
}

#[async_trait]
impl ScriptRunner for SlowRunner {
    async fn run(&self, _request: ScriptRequest) -> Result<ScriptOutput, ExecutionError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ScriptOutput {
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

fn hosts_with_runner(runner: Arc<dyn ScriptRunner>) -> Arc<HostServices> {
    Arc::new(HostServices::new(
        runner,
        Arc::new(MemoryFileReader::new()),
        Arc::new(TokioClock::new()),
    ))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn linear_chain_executes_in_order() {
    init_tracing();
    let engine = WorkflowEngine::new();

    let order = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    let order_probe = order.clone();
    engine.set_callbacks(WorkflowCallbacks::new().on_node_start(move |node_id| {
        order_probe.lock().push(node_id.to_string());
    }));

    let nodes = vec![
        Node::new("A", "memo", json!({"content": "hi"})),
        Node::bare("B", "connector"),
        Node::new("C", "memo", json!({"content": "out"})),
    ];
    let edges = vec![Edge::new("e1", "A", "B"), Edge::new("e2", "B", "C")];

    let stats = engine.run(nodes, edges).await.unwrap();

    assert_eq!(*order.lock(), vec!["A", "B", "C"]);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
    assert!(engine.errors().is_empty());

    let manager = engine.state_manager();
    assert_eq!(manager.status_of("C").await, Some(NodeStatus::Completed));
    // The memo's content slot travels the whole chain.
    assert_eq!(manager.inputs_of("C").await.get("input"), Some(&json!("hi")));

    // Dependency ordering is visible in the timestamps.
    let a = manager.get("A").await.unwrap();
    let b = manager.get("B").await.unwrap();
    let c = manager.get("C").await.unwrap();
    assert!(a.end_time.unwrap() <= b.start_time.unwrap());
    assert!(b.end_time.unwrap() <= c.start_time.unwrap());
}

#[tokio::test]
async fn diamond_joins_both_branches() {
    let engine = WorkflowEngine::new();

    let nodes = vec![
        Node::new("A", "connector", json!(42)),
        Node::bare("B", "connector"),
        Node::bare("C", "connector"),
        Node::bare("D", "connector"),
    ];
    let edges = vec![
        Edge::new("e1", "A", "B"),
        Edge::new("e2", "A", "C"),
        Edge::new("e3", "B", "D").to_handle("left"),
        Edge::new("e4", "C", "D").to_handle("right"),
    ];

    let stats = engine.run(nodes, edges).await.unwrap();
    assert_eq!(stats.completed, 4);

    let manager = engine.state_manager();
    let b = manager.get("B").await.unwrap();
    let c = manager.get("C").await.unwrap();
    let d = manager.get("D").await.unwrap();

    // Both branches finish before the join starts.
    assert!(b.end_time.unwrap() <= d.start_time.unwrap());
    assert!(c.end_time.unwrap() <= d.start_time.unwrap());

    // The join sees both predecessors in its input map.
    let inputs = manager.inputs_of("D").await;
    assert_eq!(inputs.get("left"), Some(&json!(42)));
    assert_eq!(inputs.get("right"), Some(&json!(42)));
}

#[tokio::test]
async fn cycle_is_rejected_without_state_transitions() {
    let engine = WorkflowEngine::new();

    let transitions = Arc::new(AtomicI64::new(0));
    let probe = transitions.clone();
    engine.state_manager().on_change(move |_| {
        probe.fetch_add(1, Ordering::SeqCst);
    });

    let nodes = vec![
        Node::bare("A", "connector"),
        Node::bare("B", "connector"),
        Node::bare("C", "connector"),
    ];
    let edges = vec![
        Edge::new("e1", "A", "B"),
        Edge::new("e2", "B", "C"),
        Edge::new("e3", "C", "A"),
    ];

    let result = engine.run(nodes, edges).await;
    assert!(result.is_err());
    assert_eq!(transitions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bounded_parallelism_is_respected() {
    let peak = Arc::new(AtomicI64::new(0));
    let per_node = Duration::from_millis(50);
    let hosts = hosts_with_runner(Arc::new(SlowRunner {
        active: AtomicI64::new(0),
        peak: peak.clone(),
        delay: per_node,
    }));

    let config = EngineConfig {
        max_parallelism: 3,
        ..EngineConfig::default()
    };
    let engine = WorkflowEngine::with_hosts(config, hosts);

    let nodes: Vec<Node> = (0..10)
        .map(|i| {
            Node::new(
                format!("s{}", i),
                "script",
                json!({"script": "work()", "language": "python"}),
            )
        })
        .collect();

    let started = Instant::now();
    let stats = engine.run(nodes, Vec::new()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(stats.completed, 10);
    assert!(peak.load(Ordering::SeqCst) <= 3, "parallelism bound exceeded");
    // Ten nodes in waves of three take at least four node-times.
    assert!(elapsed >= per_node * 3, "finished implausibly fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn file_node_reads_through_host() {
    let files = MemoryFileReader::new();
    files.insert("/project/readme.md", "# hello");
    let hosts = Arc::new(HostServices::new(
        Arc::new(nodeflow::host::EchoScriptRunner),
        Arc::new(files),
        Arc::new(TokioClock::new()),
    ));
    let engine = WorkflowEngine::with_hosts(EngineConfig::default(), hosts);

    let nodes = vec![
        Node::new("read", "file", json!({"path": "/project/readme.md"})),
        Node::bare("pass", "connector"),
    ];
    let edges = vec![Edge::new("e1", "read", "pass")];

    tokio_test::assert_ok!(engine.run(nodes, edges).await);

    let manager = engine.state_manager();
    assert_eq!(
        manager.inputs_of("pass").await.get("input"),
        Some(&json!("# hello"))
    );
    let read = manager.get("read").await.unwrap();
    assert_eq!(read.output.unwrap()["size"], 7);
}

#[tokio::test]
async fn rerun_on_same_engine_is_deterministic() {
    let engine = WorkflowEngine::new();

    let nodes = vec![
        Node::new("A", "connector", json!("seed")),
        Node::bare("B", "connector"),
    ];
    let edges = vec![Edge::new("e1", "A", "B")];

    engine.run(nodes.clone(), edges.clone()).await.unwrap();
    let first = engine.state_manager().get("B").await.unwrap().output;

    engine.run(nodes, edges).await.unwrap();
    let second = engine.state_manager().get("B").await.unwrap().output;

    assert_eq!(first, second);
    assert_eq!(first, Some(json!("seed")));
}

#[tokio::test]
async fn progress_is_monotonically_nondecreasing() {
    let engine = WorkflowEngine::new();

    let completions = Arc::new(parking_lot::Mutex::new(Vec::<usize>::new()));
    let probe = completions.clone();
    engine.set_callbacks(WorkflowCallbacks::new().on_progress(move |progress| {
        probe.lock().push(progress.completed);
    }));

    let nodes: Vec<Node> = (0..6)
        .map(|i| Node::new(format!("n{}", i), "connector", json!(i)))
        .collect();
    engine.run(nodes, Vec::new()).await.unwrap();

    let seen = completions.lock();
    assert!(!seen.is_empty());
    for pair in seen.windows(2) {
        assert!(pair[0] <= pair[1], "progress regressed: {:?}", *seen);
    }
    assert_eq!(*seen.last().unwrap(), 6);
}
