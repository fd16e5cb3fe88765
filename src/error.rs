//! Error taxonomy for workflow execution
//!
//! Every failure surfaced by the engine carries an [`ErrorKind`] so that the
//! recovery strategy chain can dispatch on it. The taxonomy is closed for
//! strategy dispatch but errors may carry arbitrary structured details.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of an execution failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Graph malformed, inputs failed a handler's check, unknown node type
    Validation,

    /// An executor or a transfer failed at runtime
    Runtime,

    /// An executor exceeded its time budget
    Timeout,

    /// A prerequisite state was missing when required
    Dependency,

    /// A network-level failure
    Network,

    /// A security violation
    Security,

    /// A transient failure worth retrying
    Temporary,

    /// An unrecoverable failure
    Fatal,
}

impl ErrorKind {
    /// Coarse severity classification, for presentational use only
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Fatal | ErrorKind::Security => Severity::Critical,
            ErrorKind::Runtime | ErrorKind::Dependency | ErrorKind::Validation => Severity::High,
            ErrorKind::Timeout | ErrorKind::Network => Severity::Medium,
            ErrorKind::Temporary => Severity::Low,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Network => "network",
            ErrorKind::Security => "security",
            ErrorKind::Temporary => "temporary",
            ErrorKind::Fatal => "fatal",
        };
        write!(f, "{}", name)
    }
}

/// Coarse error severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational, safe to ignore
    Low,
    /// Degraded but recoverable
    Medium,
    /// A node or transfer was lost
    High,
    /// The run cannot continue
    Critical,
}

/// An execution failure observed by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Failure classification
    pub kind: ErrorKind,

    /// Node the failure is attributed to, when known
    pub node_id: Option<String>,

    /// Human-readable description
    pub message: String,

    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,

    /// Optional structured details
    pub details: Option<serde_json::Value>,
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "{} error in node '{}': {}", self.kind, node, self.message),
            None => write!(f, "{} error: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl ExecutionError {
    /// Create a new error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: None,
            message: message.into(),
            timestamp: Utc::now(),
            details: None,
        }
    }

    /// Attribute the error to a node
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Attach structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Shorthand for a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Shorthand for a runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    /// Shorthand for a dependency error
    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dependency, message)
    }

    /// Shorthand for a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Coarse severity of this error
    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }
}

/// Aggregate a list of errors into one message, preserving each entry
pub fn summarize(errors: &[ExecutionError]) -> String {
    let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
    format!("{} error(s): {}", errors.len(), messages.join("; "))
}
