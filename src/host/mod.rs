//! Host collaborator interfaces
//!
//! The engine never spawns processes or touches the filesystem itself; those
//! side effects belong to the host IDE shell. This module defines the narrow
//! traits the engine consumes plus in-memory implementations used for wiring
//! and tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{ErrorKind, ExecutionError};

/// A script invocation request forwarded to the host
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    /// Language tag ("python", "bash", ...)
    pub language: String,

    /// Script source text
    pub source: String,

    /// Positional arguments
    pub args: Vec<String>,

    /// Environment overrides
    pub env: HashMap<String, String>,

    /// Working directory, host default when `None`
    pub cwd: Option<PathBuf>,

    /// Wall-clock budget for the invocation
    pub timeout: Duration,
}

/// Captured output of a script invocation
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// Captured standard output
    pub stdout: String,

    /// Captured standard error
    pub stderr: String,

    /// Process exit code
    pub exit_code: i32,
}

/// Executes scripts on behalf of the engine
///
/// Implementations must enforce the request's wall-clock timeout and surface
/// a breach as a `timeout` error.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run a script to completion
    async fn run(&self, request: ScriptRequest) -> Result<ScriptOutput, ExecutionError>;
}

/// Reads files on behalf of the engine
#[async_trait]
pub trait FileReader: Send + Sync {
    /// Read a file as UTF-8 text
    async fn read(&self, path: &str) -> Result<String, ExecutionError>;
}

/// Monotonic clock and timer source
#[async_trait]
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since the clock was created
    fn now_millis(&self) -> u64;

    /// Suspend for the given duration
    async fn sleep(&self, duration: Duration);
}

/// Tokio-backed monotonic clock
pub struct TokioClock {
    epoch: Instant,
}

impl TokioClock {
    /// Create a clock anchored at the current instant
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// In-memory file store for tests and headless wiring
pub struct MemoryFileReader {
    files: DashMap<String, String>,
}

impl MemoryFileReader {
    /// Create an empty store
    pub fn new() -> Self {
        Self { files: DashMap::new() }
    }

    /// Insert or replace a file
    pub fn insert(&self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }
}

impl Default for MemoryFileReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileReader for MemoryFileReader {
    async fn read(&self, path: &str) -> Result<String, ExecutionError> {
        self.files
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                ExecutionError::new(ErrorKind::Runtime, format!("file not found: {}", path))
            })
    }
}

/// Script runner double that echoes its arguments as stdout
///
/// Keeps engine wiring runnable without a host shell; real script execution
/// lives in the host IDE integration.
pub struct EchoScriptRunner;

#[async_trait]
impl ScriptRunner for EchoScriptRunner {
    async fn run(&self, request: ScriptRequest) -> Result<ScriptOutput, ExecutionError> {
        Ok(ScriptOutput {
            stdout: request.args.join(" "),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

/// Bundle of host collaborators handed to executors
pub struct HostServices {
    /// Script execution collaborator
    pub script_runner: Arc<dyn ScriptRunner>,

    /// File access collaborator
    pub file_reader: Arc<dyn FileReader>,

    /// Monotonic clock and timers
    pub clock: Arc<dyn Clock>,
}

impl HostServices {
    /// Assemble services from explicit collaborators
    pub fn new(
        script_runner: Arc<dyn ScriptRunner>,
        file_reader: Arc<dyn FileReader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            script_runner,
            file_reader,
            clock,
        }
    }

    /// Fully in-memory services: echo scripts, empty file store, tokio clock
    pub fn in_memory() -> Self {
        Self {
            script_runner: Arc::new(EchoScriptRunner),
            file_reader: Arc::new(MemoryFileReader::new()),
            clock: Arc::new(TokioClock::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_file_reader() {
        let reader = MemoryFileReader::new();
        reader.insert("/notes/a.txt", "hello");

        assert_eq!(reader.read("/notes/a.txt").await.unwrap(), "hello");

        let err = reader.read("/notes/missing.txt").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Runtime);
    }

    #[tokio::test]
    async fn test_echo_script_runner() {
        let runner = EchoScriptRunner;
        let output = runner
            .run(ScriptRequest {
                language: "bash".to_string(),
                source: "echo".to_string(),
                args: vec!["a".to_string(), "b".to_string()],
                env: HashMap::new(),
                cwd: None,
                timeout: Duration::from_secs(10),
            })
            .await
            .unwrap();
        assert_eq!(output.stdout, "a b");
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn test_tokio_clock_monotonic() {
        let clock = TokioClock::new();
        let first = clock.now_millis();
        clock.sleep(Duration::from_millis(10)).await;
        let second = clock.now_millis();
        assert!(second >= first);
    }
}
