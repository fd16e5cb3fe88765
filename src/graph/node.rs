//! Workflow node model

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A node in the workflow graph
///
/// Immutable for the duration of a run. The `data` payload is opaque to the
/// engine; only the handler registered for `node_type` interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the run
    pub id: String,

    /// Tag selecting the executor for this node
    #[serde(rename = "type")]
    pub node_type: String,

    /// Type-specific payload (memo text, file path, script body, ...)
    #[serde(default)]
    pub data: Value,
}

impl Node {
    /// Create a new node
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data,
        }
    }

    /// Create a node with an empty payload
    pub fn bare(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self::new(id, node_type, Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_creation() {
        let node = Node::new("memo-1", "memo", serde_json::json!({"content": "note"}));
        assert_eq!(node.id, "memo-1");
        assert_eq!(node.node_type, "memo");
        assert_eq!(node.data["content"], "note");
    }

    #[test]
    fn test_node_deserializes_type_tag() {
        let node: Node =
            serde_json::from_str(r#"{"id": "f1", "type": "file", "data": {"path": "/tmp/a"}}"#)
                .unwrap();
        assert_eq!(node.node_type, "file");
        assert_eq!(node.data["path"], "/tmp/a");
    }

    #[test]
    fn test_node_data_defaults_to_null() {
        let node: Node = serde_json::from_str(r#"{"id": "c1", "type": "connector"}"#).unwrap();
        assert!(node.data.is_null());
    }
}
