//! In-memory session provider for tests.
//!
//! [`ScriptedProvider`] answers code cells and shell commands from a list of
//! scripted replies, matched by substring in registration order. Sessions
//! keep a globals map that replies write into and `globals().pop(...)` lines
//! remove from. The export snippet is answered from it, so the full export
//! protocol runs without an interpreter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SandboxError;
use crate::export::{EXPORT_BEGIN_MARKER, EXPORT_END_MARKER, EXPORT_SNIPPET};
use crate::remote::{
  CodeFailure, CodeOutput, CommandOutput, OutputEvent, OutputSink, ResolvedSession, Session,
  SessionProvider,
};

/// What a scripted session answers for a matching request.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
  stdout: Vec<String>,
  stderr: String,
  error: Option<CodeFailure>,
  set: serde_json::Map<String, serde_json::Value>,
  exit_code: i32,
  delay: Option<Duration>,
}

impl ScriptedReply {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a stdout chunk. Each chunk is streamed as its own event.
  pub fn stdout(mut self, chunk: impl Into<String>) -> Self {
    self.stdout.push(chunk.into());
    self
  }

  pub fn stderr(mut self, text: impl Into<String>) -> Self {
    self.stderr.push_str(&text.into());
    self
  }

  /// Raise a Python error after the output is produced.
  pub fn raise(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.error = Some(CodeFailure {
      name: name.into(),
      value: value.into(),
      traceback: String::new(),
    });
    self
  }

  /// Leave a global behind in the session.
  pub fn set(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
    self.set.insert(name.into(), value);
    self
  }

  /// Exit code for shell commands.
  pub fn exit_code(mut self, code: i32) -> Self {
    self.exit_code = code;
    self
  }

  /// Sleep before answering.
  pub fn delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }
}

type Script = Arc<Vec<(String, ScriptedReply)>>;

/// Scripted [`SessionProvider`].
#[derive(Default)]
pub struct ScriptedProvider {
  script: Vec<(String, ScriptedReply)>,
  fail_create: bool,
  sessions: Mutex<HashMap<String, Arc<ScriptedSession>>>,
  created: AtomicUsize,
}

impl ScriptedProvider {
  pub fn new() -> Self {
    Self::default()
  }

  /// A provider whose session creation always fails.
  pub fn failing() -> Self {
    Self {
      fail_create: true,
      ..Self::default()
    }
  }

  /// Answer requests containing `pattern` with `reply`.
  pub fn reply(mut self, pattern: impl Into<String>, reply: ScriptedReply) -> Self {
    self.script.push((pattern.into(), reply));
    self
  }

  /// Number of sessions created so far.
  pub fn created_sessions(&self) -> usize {
    self.created.load(Ordering::SeqCst)
  }

  /// Every request a session received, in order. Export snippets excluded.
  pub fn calls(&self, session_id: &str) -> Vec<String> {
    self
      .sessions
      .lock()
      .ok()
      .and_then(|sessions| sessions.get(session_id).cloned())
      .map(|session| session.calls())
      .unwrap_or_default()
  }

  /// Current globals of a session.
  pub fn globals(&self, session_id: &str) -> serde_json::Map<String, serde_json::Value> {
    self
      .sessions
      .lock()
      .ok()
      .and_then(|sessions| sessions.get(session_id).cloned())
      .map(|session| session.globals())
      .unwrap_or_default()
  }
}

#[async_trait]
impl SessionProvider for ScriptedProvider {
  fn max_timeout(&self) -> Duration {
    Duration::from_secs(3600)
  }

  async fn find(&self, session_id: &str) -> Option<Arc<dyn Session>> {
    let sessions = self.sessions.lock().ok()?;
    sessions
      .get(session_id)
      .cloned()
      .map(|session| session as Arc<dyn Session>)
  }

  async fn find_or_create(
    &self,
    session_id: &str,
    _timeout: Duration,
  ) -> Result<ResolvedSession, SandboxError> {
    if self.fail_create {
      return Err(SandboxError::session_init(session_id, "scripted failure"));
    }

    let mut sessions = self
      .sessions
      .lock()
      .map_err(|_| SandboxError::session_init(session_id, "session table poisoned"))?;
    if let Some(session) = sessions.get(session_id) {
      return Ok(ResolvedSession {
        session: session.clone() as Arc<dyn Session>,
        created: false,
      });
    }

    let session = Arc::new(ScriptedSession {
      session_id: session_id.to_string(),
      script: Arc::new(self.script.clone()),
      globals: Mutex::new(serde_json::Map::new()),
      calls: Mutex::new(Vec::new()),
      run_lock: tokio::sync::Mutex::new(()),
    });
    sessions.insert(session_id.to_string(), session.clone());
    self.created.fetch_add(1, Ordering::SeqCst);
    Ok(ResolvedSession {
      session: session as Arc<dyn Session>,
      created: true,
    })
  }
}

struct ScriptedSession {
  session_id: String,
  script: Script,
  globals: Mutex<serde_json::Map<String, serde_json::Value>>,
  calls: Mutex<Vec<String>>,
  run_lock: tokio::sync::Mutex<()>,
}

impl ScriptedSession {
  fn calls(&self) -> Vec<String> {
    self.calls.lock().map(|c| c.clone()).unwrap_or_default()
  }

  fn globals(&self) -> serde_json::Map<String, serde_json::Value> {
    self.globals.lock().map(|g| g.clone()).unwrap_or_default()
  }

  fn lookup(&self, request: &str) -> ScriptedReply {
    if let Ok(mut calls) = self.calls.lock() {
      calls.push(request.to_string());
    }
    self
      .script
      .iter()
      .find(|(pattern, _)| request.contains(pattern.as_str()))
      .map(|(_, reply)| reply.clone())
      .unwrap_or_default()
  }

  fn export_output(&self) -> CodeOutput {
    let payload = serde_json::Value::Object(self.globals()).to_string();
    CodeOutput {
      stdout: format!("{}\n{}\n{}\n", EXPORT_BEGIN_MARKER, payload, EXPORT_END_MARKER),
      ..CodeOutput::default()
    }
  }
}

#[async_trait]
impl Session for ScriptedSession {
  fn session_id(&self) -> &str {
    &self.session_id
  }

  fn run_lock(&self) -> &tokio::sync::Mutex<()> {
    &self.run_lock
  }

  fn is_alive(&self) -> bool {
    true
  }

  async fn run_code(
    &self,
    code: &str,
    sink: Option<OutputSink>,
    timeout: Duration,
  ) -> Result<CodeOutput, SandboxError> {
    if code == EXPORT_SNIPPET {
      return Ok(self.export_output());
    }

    if let Ok(mut globals) = self.globals.lock() {
      for name in code.lines().filter_map(popped_global) {
        globals.remove(name);
      }
    }

    let reply = self.lookup(code);
    if let Some(delay) = reply.delay {
      if delay > timeout {
        return Err(SandboxError::Timeout { timeout });
      }
      tokio::time::sleep(delay).await;
    }

    if let Ok(mut globals) = self.globals.lock() {
      globals.extend(reply.set.clone());
    }

    if let Some(sink) = &sink {
      for chunk in &reply.stdout {
        let _ = sink.send(OutputEvent::stdout(chunk.clone()));
      }
      if !reply.stderr.is_empty() {
        let _ = sink.send(OutputEvent::stderr(reply.stderr.clone()));
      }
    }

    Ok(CodeOutput {
      stdout: reply.stdout.concat(),
      stderr: reply.stderr,
      error: reply.error,
    })
  }

  async fn run_command(
    &self,
    command: &str,
    _timeout: Duration,
  ) -> Result<CommandOutput, SandboxError> {
    let reply = self.lookup(command);
    Ok(CommandOutput {
      exit_code: reply.exit_code,
      stdout: reply.stdout.concat(),
      stderr: reply.stderr,
    })
  }

  async fn terminate(&self) {}
}

/// Name removed by a `globals().pop("<name>", None)` line.
fn popped_global(line: &str) -> Option<&str> {
  line
    .trim()
    .strip_prefix("globals().pop(\"")?
    .strip_suffix("\", None)")
}
