//! Sandbox error types.

use std::time::Duration;

use crate::scan::ScanFinding;

/// Errors that can occur while running sandboxed code.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
  /// The static scan flagged the source. The code was not executed.
  #[error("security scan rejected the code:\n{}", render_findings(.findings))]
  SecurityScan { findings: Vec<ScanFinding> },

  /// A remote session could not be created or attached. Terminal for the
  /// session id.
  #[error("failed to initialize sandbox session '{session_id}': {message}")]
  SessionInit { session_id: String, message: String },

  /// The user code failed.
  #[error("{message}")]
  Execution { message: String },

  /// The run hit its time ceiling.
  #[error("execution timed out after {}ms", .timeout.as_millis())]
  Timeout { timeout: Duration },

  /// A shell command exited non-zero. Remaining commands were not run.
  #[error("command `{command}` exited with code {exit_code}{}", render_stderr(.stderr))]
  CommandFailed {
    command: String,
    exit_code: i32,
    stderr: String,
  },

  /// Communication with a session's worker broke down.
  #[error("sandbox session '{session_id}' transport failed: {message}")]
  Transport { session_id: String, message: String },
}

impl SandboxError {
  /// Create an execution error.
  pub fn execution(message: impl Into<String>) -> Self {
    Self::Execution {
      message: message.into(),
    }
  }

  /// Create a session initialization error.
  pub fn session_init(session_id: impl Into<String>, message: impl Into<String>) -> Self {
    Self::SessionInit {
      session_id: session_id.into(),
      message: message.into(),
    }
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, Self::Timeout { .. })
  }
}

fn render_findings(findings: &[ScanFinding]) -> String {
  findings
    .iter()
    .map(|f| f.to_string())
    .collect::<Vec<_>>()
    .join("\n")
}

fn render_stderr(stderr: &str) -> String {
  let stderr = stderr.trim();
  if stderr.is_empty() {
    String::new()
  } else {
    format!(": {}", stderr)
  }
}

/// Failure to recover exported variables from sandbox output.
///
/// Never fails a step; exported variables degrade to empty.
#[derive(Debug, thiserror::Error)]
pub enum ExportDecodeError {
  #[error("export markers not found in output")]
  MissingMarkers,

  #[error("export payload is not valid JSON: {message}")]
  InvalidJson { message: String },

  #[error("export payload is not a JSON object")]
  NotAnObject,
}
