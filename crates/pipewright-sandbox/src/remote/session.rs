//! Session abstraction for remote execution.
//!
//! A [`SessionProvider`] hands out long-lived [`Session`]s addressed by a
//! caller-supplied id. State (Python globals, working directory files)
//! persists across calls to the same session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

use crate::error::SandboxError;

/// Which channel an output chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
  Stdout,
  Stderr,
  Error,
}

/// A chunk of output produced while code runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
  pub stream: OutputStream,
  pub text: String,
}

impl OutputEvent {
  pub fn stdout(text: impl Into<String>) -> Self {
    Self {
      stream: OutputStream::Stdout,
      text: text.into(),
    }
  }

  pub fn stderr(text: impl Into<String>) -> Self {
    Self {
      stream: OutputStream::Stderr,
      text: text.into(),
    }
  }
}

/// Receives output chunks as they are produced.
pub type OutputSink = mpsc::UnboundedSender<OutputEvent>;

/// A Python-level failure reported by the session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeFailure {
  pub name: String,
  pub value: String,
  #[serde(default)]
  pub traceback: String,
}

impl fmt::Display for CodeFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.name, self.value)?;
    if !self.traceback.trim().is_empty() {
      write!(f, "\n{}", self.traceback.trim_end())?;
    }
    Ok(())
  }
}

/// Result of running a code cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeOutput {
  pub stdout: String,
  pub stderr: String,
  pub error: Option<CodeFailure>,
}

/// Result of running a shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
  pub exit_code: i32,
  pub stdout: String,
  pub stderr: String,
}

/// A live execution session.
///
/// Implementations serialize individual calls. A caller that needs several
/// calls to run back to back (setup, code and export) holds
/// [`run_lock`](Session::run_lock) across them.
#[async_trait]
pub trait Session: Send + Sync {
  fn session_id(&self) -> &str;

  /// Lock held by one run for its whole duration.
  fn run_lock(&self) -> &Mutex<()>;

  /// Whether the session can still accept work.
  fn is_alive(&self) -> bool;

  /// Run a Python code cell. Output chunks are forwarded to `sink` as they
  /// arrive when one is given.
  async fn run_code(
    &self,
    code: &str,
    sink: Option<OutputSink>,
    timeout: Duration,
  ) -> Result<CodeOutput, SandboxError>;

  /// Run a single shell command in the session's working directory.
  async fn run_command(
    &self,
    command: &str,
    timeout: Duration,
  ) -> Result<CommandOutput, SandboxError>;

  /// Stop the session and release its resources.
  async fn terminate(&self);
}

/// Creates and looks up sessions by id.
#[async_trait]
pub trait SessionProvider: Send + Sync {
  /// Largest session lifetime the provider supports.
  fn max_timeout(&self) -> Duration;

  /// Find a live session with this id.
  async fn find(&self, session_id: &str) -> Option<Arc<dyn Session>>;

  /// Return the live session with this id, creating one with lifetime
  /// `timeout` when there is none.
  ///
  /// Atomic per id: concurrent callers share a single new session, and a
  /// live session is never replaced.
  async fn find_or_create(
    &self,
    session_id: &str,
    timeout: Duration,
  ) -> Result<ResolvedSession, SandboxError>;
}

/// A session handed out by [`SessionProvider::find_or_create`].
pub struct ResolvedSession {
  pub session: Arc<dyn Session>,
  /// Whether this call started the session.
  pub created: bool,
}
