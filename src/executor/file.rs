//! File node handler

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ExecutionError;
use crate::executor::{ExecutorContext, InputMap, NodeExecutor};
use crate::graph::Node;

/// Reads a file through the host file reader
pub struct FileExecutor;

impl FileExecutor {
    fn path(node: &Node) -> Option<String> {
        node.data.get("path").and_then(Value::as_str).map(str::to_string)
    }
}

#[async_trait]
impl NodeExecutor for FileExecutor {
    fn outputs(&self) -> Vec<String> {
        vec!["output".to_string(), "content".to_string()]
    }

    fn validate(&self, node: &Node, _inputs: &InputMap) -> Vec<ExecutionError> {
        match Self::path(node) {
            Some(path) if !path.is_empty() => Vec::new(),
            _ => vec![ExecutionError::validation("file node requires a 'path' in its payload")
                .with_node(&node.id)],
        }
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutorContext,
        _inputs: &InputMap,
    ) -> Result<Value, ExecutionError> {
        let path = Self::path(node).ok_or_else(|| {
            ExecutionError::validation("file node requires a 'path' in its payload")
        })?;

        let content = ctx.hosts.file_reader.read(&path).await?;
        Ok(json!({
            "content": content,
            "path": path,
            "size": content.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::host::{HostServices, MemoryFileReader, EchoScriptRunner, TokioClock};
    use std::sync::Arc;

    fn context_with_files(files: &[(&str, &str)]) -> ExecutorContext {
        let reader = MemoryFileReader::new();
        for (path, content) in files {
            reader.insert(*path, *content);
        }
        let hosts = HostServices::new(
            Arc::new(EchoScriptRunner),
            Arc::new(reader),
            Arc::new(TokioClock::new()),
        );
        ExecutorContext::new("exec-test", Arc::new(hosts))
    }

    #[tokio::test]
    async fn test_file_read() {
        let ctx = context_with_files(&[("/notes/todo.txt", "ship it")]);
        let node = Node::new("f", "file", json!({"path": "/notes/todo.txt"}));
        let output = FileExecutor.execute(&node, &ctx, &InputMap::new()).await.unwrap();
        assert_eq!(output["content"], "ship it");
        assert_eq!(output["size"], 7);
    }

    #[tokio::test]
    async fn test_missing_file_is_runtime_error() {
        let ctx = context_with_files(&[]);
        let node = Node::new("f", "file", json!({"path": "/absent"}));
        let err = FileExecutor.execute(&node, &ctx, &InputMap::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Runtime);
    }

    #[tokio::test]
    async fn test_missing_path_fails_validation() {
        let node = Node::bare("f", "file");
        let problems = FileExecutor.validate(&node, &InputMap::new());
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].kind, ErrorKind::Validation);
    }
}
