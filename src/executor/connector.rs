//! Connector node handler

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ExecutionError;
use crate::executor::{ExecutorContext, InputMap, NodeExecutor};
use crate::graph::edge::INPUT_HANDLE;
use crate::graph::Node;

/// Identity handler: propagates its single input unchanged
///
/// With no connected input the connector emits its own payload, which lets a
/// connector act as a constant source.
pub struct ConnectorExecutor;

#[async_trait]
impl NodeExecutor for ConnectorExecutor {
    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutorContext,
        inputs: &InputMap,
    ) -> Result<Value, ExecutionError> {
        let value = inputs
            .get(INPUT_HANDLE)
            .cloned()
            .or_else(|| {
                if inputs.len() == 1 {
                    inputs.values().next().cloned()
                } else {
                    None
                }
            })
            .unwrap_or_else(|| node.data.clone());
        Ok(value)
    }
}
