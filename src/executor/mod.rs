//! Node executor registry and handler surface
//!
//! Each node type is served by a [`NodeExecutor`] registered under its type
//! tag. Handlers validate their inputs as a list of errors (non-throwing) and
//! execute asynchronously against the host collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::{summarize, ErrorKind, ExecutionError};
use crate::graph::edge::OUTPUT_HANDLE;
use crate::graph::Node;
use crate::host::HostServices;
use crate::transfer::ValueKind;

pub mod connector;
pub mod file;
pub mod memo;
pub mod script;

pub use connector::ConnectorExecutor;
pub use file::FileExecutor;
pub use memo::MemoExecutor;
pub use script::ScriptExecutor;

/// Type tag of the memo handler
pub const MEMO_TYPE: &str = "memo";

/// Type tag of the file handler
pub const FILE_TYPE: &str = "file";

/// Type tag of the script handler
pub const SCRIPT_TYPE: &str = "script";

/// Type tag of the connector handler
pub const CONNECTOR_TYPE: &str = "connector";

/// Resolved inputs for one node, keyed by target handle
pub type InputMap = HashMap<String, Value>;

/// Sentinel output written for skipped nodes
pub fn skip_sentinel() -> Value {
    serde_json::json!({"skipped": true})
}

/// Whether a value is the skip sentinel
pub fn is_skip_sentinel(value: &Value) -> bool {
    value.get("skipped").and_then(Value::as_bool) == Some(true)
}

/// Per-run context handed to executors
#[derive(Clone)]
pub struct ExecutorContext {
    /// Id of the run this execution belongs to
    pub execution_id: String,

    /// Host collaborators (script runner, file reader, clock)
    pub hosts: Arc<HostServices>,

    /// Wall-clock budget for script invocations
    pub script_timeout: Duration,
}

impl ExecutorContext {
    /// Create a context with the default 10 s script budget
    pub fn new(execution_id: impl Into<String>, hosts: Arc<HostServices>) -> Self {
        Self {
            execution_id: execution_id.into(),
            hosts,
            script_timeout: Duration::from_secs(10),
        }
    }

    /// Override the script budget
    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = timeout;
        self
    }
}

/// Handler for one node type
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Input handles that must be present before execution
    fn required_inputs(&self) -> Vec<String> {
        Vec::new()
    }

    /// Output handles this handler may produce
    fn outputs(&self) -> Vec<String> {
        vec![OUTPUT_HANDLE.to_string()]
    }

    /// All input handles this handler recognizes
    fn input_handles(&self) -> Vec<String> {
        self.required_inputs()
    }

    /// Expected kind for an input handle, `None` when any kind is accepted
    fn input_type(&self, _handle: &str) -> Option<ValueKind> {
        None
    }

    /// Check the node payload and inputs, returning every problem found
    fn validate(&self, _node: &Node, _inputs: &InputMap) -> Vec<ExecutionError> {
        Vec::new()
    }

    /// Run the node and produce its output value
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutorContext,
        inputs: &InputMap,
    ) -> Result<Value, ExecutionError>;
}

/// Registry of handlers keyed by node type tag
pub struct ExecutorRegistry {
    handlers: DashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self { handlers: DashMap::new() }
    }

    /// Create a registry pre-populated with the built-in handlers
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(MEMO_TYPE, Arc::new(MemoExecutor));
        registry.register(FILE_TYPE, Arc::new(FileExecutor));
        registry.register(SCRIPT_TYPE, Arc::new(ScriptExecutor::new()));
        registry.register(CONNECTOR_TYPE, Arc::new(ConnectorExecutor));
        registry
    }

    /// Register a handler for a type tag, replacing any previous one
    pub fn register(&self, type_tag: impl Into<String>, handler: Arc<dyn NodeExecutor>) {
        self.handlers.insert(type_tag.into(), handler);
    }

    /// Look up the handler for a type tag
    pub fn get(&self, type_tag: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.handlers.get(type_tag).map(|entry| entry.value().clone())
    }

    /// Whether a handler is registered for the tag
    pub fn contains(&self, type_tag: &str) -> bool {
        self.handlers.contains_key(type_tag)
    }

    /// Validate and execute a node through its registered handler
    pub async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutorContext,
        inputs: &InputMap,
    ) -> Result<Value, ExecutionError> {
        let handler = self.get(&node.node_type).ok_or_else(|| {
            ExecutionError::new(
                ErrorKind::Validation,
                format!("no handler registered for node type '{}'", node.node_type),
            )
            .with_node(&node.id)
        })?;

        let problems = handler.validate(node, inputs);
        if !problems.is_empty() {
            return Err(ExecutionError::new(ErrorKind::Validation, summarize(&problems))
                .with_node(&node.id));
        }

        for required in handler.required_inputs() {
            if !inputs.contains_key(&required) {
                return Err(ExecutionError::new(
                    ErrorKind::Validation,
                    format!("missing required input '{}'", required),
                )
                .with_node(&node.id));
            }
        }

        debug!(node_id = %node.id, node_type = %node.node_type, "executing node");
        handler
            .execute(node, ctx, inputs)
            .await
            .map_err(|e| if e.node_id.is_none() { e.with_node(&node.id) } else { e })
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
