//! Error types shared across the sandbox.

use std::io;
use std::time::Duration;

/// File name shown in tracebacks and syntax errors.
pub const SOURCE_PATH: &str = "<student code>";

/// Errors from sandbox plumbing (not from the submitted program).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("worker I/O failed: {0}")]
    WorkerIo(#[source] io::Error),

    #[error("worker sent a malformed reply: {0}")]
    WorkerReply(#[source] serde_json::Error),

    #[error("worker exited without a result ({0})")]
    WorkerExited(String),

    #[error("worker did not start within {0:?}")]
    StartupTimeout(Duration),

    #[error("{0} thread panicked: {1}")]
    Panicked(&'static str, String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown capability `{0}`")]
    UnknownCapability(String),

    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),

    #[error("default `{0}` exceeds its ceiling")]
    AboveCeiling(&'static str),
}

/// A submission that could not be parsed or compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SyntaxError {
    /// `SyntaxError` or `IndentationError`.
    pub kind: &'static str,
    pub message: String,
    pub line: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: usize) -> Self {
        Self {
            kind: "SyntaxError",
            message: message.into(),
            line,
        }
    }

    pub fn indentation(message: impl Into<String>, line: usize) -> Self {
        Self {
            kind: "IndentationError",
            message: message.into(),
            line,
        }
    }

    /// Traceback-style rendering shown to the student.
    pub fn render(&self, source: &str) -> String {
        let mut out = format!("  File \"{SOURCE_PATH}\", line {}\n", self.line);
        if let Some(text) = source.lines().nth(self.line.saturating_sub(1)) {
            let text = text.trim();
            if !text.is_empty() {
                out.push_str("    ");
                out.push_str(text);
                out.push('\n');
            }
        }
        out.push_str(&format!("{}: {}\n", self.kind, self.message));
        out
    }
}
