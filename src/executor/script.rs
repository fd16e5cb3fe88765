//! Script node handler

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ExecutionError;
use crate::executor::{is_skip_sentinel, ExecutorContext, InputMap, NodeExecutor};
use crate::graph::Node;
use crate::host::ScriptRequest;

/// Forwards a script body to the host script runner
///
/// The node payload carries `script` (source text) and `language`; optional
/// `env` and `cwd` are passed through to the host. Inputs become positional
/// arguments ordered by handle name.
pub struct ScriptExecutor {
    languages: HashSet<String>,
}

impl ScriptExecutor {
    /// Handler supporting the default language set
    pub fn new() -> Self {
        Self::with_languages(["python", "javascript", "bash", "sh"])
    }

    /// Handler supporting an explicit language set
    pub fn with_languages<I, S>(languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            languages: languages.into_iter().map(Into::into).collect(),
        }
    }

    fn source(node: &Node) -> Option<&str> {
        node.data.get("script").and_then(Value::as_str)
    }

    fn language(node: &Node) -> &str {
        node.data.get("language").and_then(Value::as_str).unwrap_or("python")
    }

    /// Positional arguments: inputs ordered by handle name, stringified
    fn args(inputs: &InputMap) -> Vec<String> {
        let mut handles: Vec<&String> = inputs.keys().collect();
        handles.sort();
        handles
            .into_iter()
            .filter_map(|handle| {
                let value = &inputs[handle];
                if is_skip_sentinel(value) {
                    return None;
                }
                Some(match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
            })
            .collect()
    }
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for ScriptExecutor {
    fn outputs(&self) -> Vec<String> {
        vec![
            "output".to_string(),
            "result".to_string(),
            "stdout".to_string(),
            "stderr".to_string(),
        ]
    }

    fn input_handles(&self) -> Vec<String> {
        // Scripts accept any number of positional inputs.
        Vec::new()
    }

    fn validate(&self, node: &Node, _inputs: &InputMap) -> Vec<ExecutionError> {
        let mut problems = Vec::new();
        match Self::source(node) {
            Some(source) if !source.trim().is_empty() => {}
            _ => problems.push(
                ExecutionError::validation("script node requires a non-empty 'script' payload")
                    .with_node(&node.id),
            ),
        }
        let language = Self::language(node);
        if !self.languages.contains(language) {
            problems.push(
                ExecutionError::validation(format!("unsupported script language '{}'", language))
                    .with_node(&node.id),
            );
        }
        problems
    }

    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutorContext,
        inputs: &InputMap,
    ) -> Result<Value, ExecutionError> {
        let source = Self::source(node).ok_or_else(|| {
            ExecutionError::validation("script node requires a non-empty 'script' payload")
        })?;
        let language = Self::language(node).to_string();
        let args = Self::args(inputs);

        let env: HashMap<String, String> = node
            .data
            .get("env")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let cwd = node.data.get("cwd").and_then(Value::as_str).map(PathBuf::from);

        debug!(node_id = %node.id, %language, args = args.len(), "running script");
        let output = ctx
            .hosts
            .script_runner
            .run(ScriptRequest {
                language,
                source: source.to_string(),
                args,
                env,
                cwd,
                timeout: ctx.script_timeout,
            })
            .await?;

        if output.exit_code != 0 {
            return Err(ExecutionError::runtime(format!(
                "script exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            ))
            .with_details(json!({
                "stdout": output.stdout,
                "stderr": output.stderr,
                "exit_code": output.exit_code,
            })));
        }

        Ok(json!({
            "result": output.stdout.trim(),
            "stdout": output.stdout,
            "stderr": output.stderr,
            "exit_code": output.exit_code,
        }))
    }
}
