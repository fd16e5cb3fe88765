//! Memo node handler

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::ExecutionError;
use crate::executor::{ExecutorContext, InputMap, NodeExecutor};
use crate::graph::Node;

/// Returns the memo text from the node payload, stamped with the read time
pub struct MemoExecutor;

impl MemoExecutor {
    fn content(node: &Node) -> String {
        match &node.data {
            Value::String(text) => text.clone(),
            other => other
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

#[async_trait]
impl NodeExecutor for MemoExecutor {
    fn outputs(&self) -> Vec<String> {
        vec!["output".to_string(), "content".to_string()]
    }

    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutorContext,
        _inputs: &InputMap,
    ) -> Result<Value, ExecutionError> {
        Ok(json!({
            "content": Self::content(node),
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }
}
