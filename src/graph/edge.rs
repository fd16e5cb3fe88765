//! Workflow edge model

use serde::{Deserialize, Serialize};

/// Default output handle name
pub const OUTPUT_HANDLE: &str = "output";

/// Default input handle name
pub const INPUT_HANDLE: &str = "input";

fn default_source_handle() -> String {
    OUTPUT_HANDLE.to_string()
}

fn default_target_handle() -> String {
    INPUT_HANDLE.to_string()
}

/// A directed data-flow edge between two node slots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Unique identifier within the run
    pub id: String,

    /// Id of the producing node
    pub source: String,

    /// Output slot on the producing node
    #[serde(default = "default_source_handle")]
    pub source_handle: String,

    /// Id of the consuming node
    pub target: String,

    /// Input slot on the consuming node
    #[serde(default = "default_target_handle")]
    pub target_handle: String,
}

impl Edge {
    /// Create an edge with default handles
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: default_source_handle(),
            target: target.into(),
            target_handle: default_target_handle(),
        }
    }

    /// Override the output slot on the producing node
    pub fn from_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = handle.into();
        self
    }

    /// Override the input slot on the consuming node
    pub fn to_handle(mut self, handle: impl Into<String>) -> Self {
        self.target_handle = handle.into();
        self
    }
}
