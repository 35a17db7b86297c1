//! Session provider backed by local Python worker processes.
//!
//! Each session id owns one long-lived `python3` process running the
//! embedded worker. Requests and events travel as JSON lines over the
//! worker's stdin and stdout. A call that overruns its timeout kills the
//! worker; the session is then gone and the next call with the same id
//! starts a fresh one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::session::{
  CodeFailure, CodeOutput, CommandOutput, OutputEvent, OutputSink, OutputStream, ResolvedSession,
  Session, SessionProvider,
};
use crate::error::SandboxError;

const WORKER_SOURCE: &str = include_str!("worker.py");
const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for [`ProcessSessionProvider`].
#[derive(Debug, Clone)]
pub struct ProcessProviderConfig {
  /// Python interpreter to launch.
  pub program: String,
  /// Hard ceiling on a session's lifetime.
  pub max_lifetime: Duration,
  /// Parent directory for per-session working directories.
  pub working_root: PathBuf,
}

impl Default for ProcessProviderConfig {
  fn default() -> Self {
    Self {
      program: "python3".to_string(),
      max_lifetime: Duration::from_secs(3600),
      working_root: std::env::temp_dir().join("pipewright-sessions"),
    }
  }
}

/// Spawns one worker process per session id.
pub struct ProcessSessionProvider {
  config: ProcessProviderConfig,
  sessions: Mutex<HashMap<String, Arc<ProcessSession>>>,
  creating: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProcessSessionProvider {
  pub fn new(config: ProcessProviderConfig) -> Self {
    Self {
      config,
      sessions: Mutex::new(HashMap::new()),
      creating: Mutex::new(HashMap::new()),
    }
  }

  /// Terminate every session this provider owns.
  pub async fn shutdown(&self) {
    let sessions: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
    for session in sessions {
      session.terminate().await;
    }
  }

  fn working_dir(&self, session_id: &str) -> PathBuf {
    let sanitized: String = session_id
      .chars()
      .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
      .collect();
    self.config.working_root.join(sanitized)
  }

  /// Per-id lock serializing session creation.
  async fn creation_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
    self
      .creating
      .lock()
      .await
      .entry(session_id.to_string())
      .or_default()
      .clone()
  }

  #[instrument(name = "process_session_spawn", skip(self))]
  async fn spawn(
    &self,
    session_id: &str,
    timeout: Duration,
  ) -> Result<Arc<ProcessSession>, SandboxError> {
    let lifetime = timeout.min(self.config.max_lifetime);
    let working_dir = self.working_dir(session_id);
    tokio::fs::create_dir_all(&working_dir)
      .await
      .map_err(|e| SandboxError::session_init(session_id, e.to_string()))?;

    let mut child = Command::new(&self.config.program)
      .arg("-u")
      .arg("-c")
      .arg(WORKER_SOURCE)
      .current_dir(&working_dir)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| {
        SandboxError::session_init(
          session_id,
          format!("failed to start '{}': {}", self.config.program, e),
        )
      })?;

    let stdin = child
      .stdin
      .take()
      .ok_or_else(|| SandboxError::session_init(session_id, "worker stdin unavailable"))?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| SandboxError::session_init(session_id, "worker stdout unavailable"))?;

    let mut worker = Worker {
      child,
      stdin,
      events: BufReader::new(stdout).lines(),
    };

    match tokio::time::timeout(STARTUP_TIMEOUT, worker.next_event()).await {
      Ok(Ok(Some(WorkerEvent::Ready))) => {}
      Ok(Ok(other)) => {
        worker.kill().await;
        return Err(SandboxError::session_init(
          session_id,
          format!("unexpected worker handshake: {:?}", other),
        ));
      }
      Ok(Err(message)) => {
        worker.kill().await;
        return Err(SandboxError::session_init(session_id, message));
      }
      Err(_) => {
        worker.kill().await;
        return Err(SandboxError::session_init(
          session_id,
          "worker did not become ready",
        ));
      }
    }

    info!(
      session_id = %session_id,
      lifetime_secs = lifetime.as_secs(),
      "worker_started"
    );
    Ok(Arc::new(ProcessSession {
      session_id: session_id.to_string(),
      expires_at: Instant::now() + lifetime,
      alive: AtomicBool::new(true),
      run_lock: Mutex::new(()),
      worker: Mutex::new(worker),
    }))
  }
}

impl Default for ProcessSessionProvider {
  fn default() -> Self {
    Self::new(ProcessProviderConfig::default())
  }
}

#[async_trait]
impl SessionProvider for ProcessSessionProvider {
  fn max_timeout(&self) -> Duration {
    self.config.max_lifetime
  }

  async fn find(&self, session_id: &str) -> Option<Arc<dyn Session>> {
    let mut sessions = self.sessions.lock().await;
    let session = sessions.get(session_id)?.clone();
    if session.is_alive() {
      return Some(session as Arc<dyn Session>);
    }

    sessions.remove(session_id);
    drop(sessions);
    debug!(session_id = %session_id, "session_expired");
    session.terminate().await;
    None
  }

  async fn find_or_create(
    &self,
    session_id: &str,
    timeout: Duration,
  ) -> Result<ResolvedSession, SandboxError> {
    let creation = self.creation_lock(session_id).await;
    let _creating = creation.lock().await;

    if let Some(session) = self.find(session_id).await {
      return Ok(ResolvedSession {
        session,
        created: false,
      });
    }

    let session = self.spawn(session_id, timeout).await?;
    self
      .sessions
      .lock()
      .await
      .insert(session_id.to_string(), session.clone());
    Ok(ResolvedSession {
      session: session as Arc<dyn Session>,
      created: true,
    })
  }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WorkerRequest<'a> {
  Exec { code: &'a str },
  Shell { command: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WorkerEvent {
  Ready,
  Stdout {
    text: String,
  },
  Stderr {
    text: String,
  },
  Error {
    name: String,
    value: String,
    #[serde(default)]
    traceback: String,
  },
  Exit {
    code: i32,
  },
  Done,
}

struct Worker {
  child: Child,
  stdin: ChildStdin,
  events: Lines<BufReader<ChildStdout>>,
}

impl Worker {
  async fn send(&mut self, request: &WorkerRequest<'_>) -> Result<(), String> {
    let mut line = serde_json::to_string(request).map_err(|e| e.to_string())?;
    line.push('\n');
    self
      .stdin
      .write_all(line.as_bytes())
      .await
      .map_err(|e| e.to_string())?;
    self.stdin.flush().await.map_err(|e| e.to_string())
  }

  /// Next protocol event. `Ok(None)` means the worker closed its stdout.
  async fn next_event(&mut self) -> Result<Option<WorkerEvent>, String> {
    loop {
      let Some(line) = self.events.next_line().await.map_err(|e| e.to_string())? else {
        return Ok(None);
      };
      if line.trim().is_empty() {
        continue;
      }
      return serde_json::from_str(&line)
        .map(Some)
        .map_err(|e| format!("malformed worker event: {}", e));
    }
  }

  /// Send `request` and collect events until the worker reports completion.
  async fn request(
    &mut self,
    request: &WorkerRequest<'_>,
    sink: Option<&OutputSink>,
  ) -> Result<Exchange, String> {
    self.send(request).await?;
    let mut exchange = Exchange::default();
    loop {
      match self.next_event().await? {
        None => return Err("worker exited unexpectedly".to_string()),
        Some(WorkerEvent::Done) => return Ok(exchange),
        Some(event) => exchange.apply(event, sink),
      }
    }
  }

  async fn kill(&mut self) {
    if let Err(e) = self.child.kill().await {
      debug!(error = %e, "worker_kill_failed");
    }
  }
}

/// A session backed by one worker process.
pub struct ProcessSession {
  session_id: String,
  expires_at: Instant,
  alive: AtomicBool,
  run_lock: Mutex<()>,
  worker: Mutex<Worker>,
}

impl ProcessSession {
  fn transport_error(&self, message: impl Into<String>) -> SandboxError {
    SandboxError::Transport {
      session_id: self.session_id.clone(),
      message: message.into(),
    }
  }

  /// Run one request under `timeout`. A timeout or broken pipe kills the
  /// worker.
  async fn exchange(
    &self,
    request: WorkerRequest<'_>,
    sink: Option<OutputSink>,
    timeout: Duration,
  ) -> Result<Exchange, SandboxError> {
    if !self.is_alive() {
      return Err(self.transport_error("session is no longer alive"));
    }

    let mut worker = self.worker.lock().await;
    let collected =
      tokio::time::timeout(timeout, worker.request(&request, sink.as_ref())).await;

    match collected {
      Ok(Ok(exchange)) => Ok(exchange),
      Ok(Err(message)) => {
        self.alive.store(false, Ordering::SeqCst);
        worker.kill().await;
        Err(self.transport_error(message))
      }
      Err(_) => {
        warn!(
          session_id = %self.session_id,
          timeout_ms = timeout.as_millis() as u64,
          "worker_timeout"
        );
        self.alive.store(false, Ordering::SeqCst);
        worker.kill().await;
        Err(SandboxError::Timeout { timeout })
      }
    }
  }
}

#[derive(Debug, Default)]
struct Exchange {
  stdout: String,
  stderr: String,
  error: Option<CodeFailure>,
  exit_code: Option<i32>,
}

impl Exchange {
  fn apply(&mut self, event: WorkerEvent, sink: Option<&OutputSink>) {
    match event {
      WorkerEvent::Stdout { text } => {
        if let Some(sink) = sink {
          let _ = sink.send(OutputEvent::stdout(text.clone()));
        }
        self.stdout.push_str(&text);
      }
      WorkerEvent::Stderr { text } => {
        if let Some(sink) = sink {
          let _ = sink.send(OutputEvent::stderr(text.clone()));
        }
        self.stderr.push_str(&text);
      }
      WorkerEvent::Error {
        name,
        value,
        traceback,
      } => {
        let failure = CodeFailure {
          name,
          value,
          traceback,
        };
        if let Some(sink) = sink {
          let _ = sink.send(OutputEvent {
            stream: OutputStream::Error,
            text: failure.to_string(),
          });
        }
        self.error = Some(failure);
      }
      WorkerEvent::Exit { code } => self.exit_code = Some(code),
      WorkerEvent::Ready | WorkerEvent::Done => {}
    }
  }
}

#[async_trait]
impl Session for ProcessSession {
  fn session_id(&self) -> &str {
    &self.session_id
  }

  fn run_lock(&self) -> &Mutex<()> {
    &self.run_lock
  }

  fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst) && Instant::now() < self.expires_at
  }

  async fn run_code(
    &self,
    code: &str,
    sink: Option<OutputSink>,
    timeout: Duration,
  ) -> Result<CodeOutput, SandboxError> {
    let exchange = self
      .exchange(WorkerRequest::Exec { code }, sink, timeout)
      .await?;
    Ok(CodeOutput {
      stdout: exchange.stdout,
      stderr: exchange.stderr,
      error: exchange.error,
    })
  }

  async fn run_command(
    &self,
    command: &str,
    timeout: Duration,
  ) -> Result<CommandOutput, SandboxError> {
    let exchange = self
      .exchange(WorkerRequest::Shell { command }, None, timeout)
      .await?;
    Ok(CommandOutput {
      exit_code: exchange.exit_code.unwrap_or(-1),
      stdout: exchange.stdout,
      stderr: exchange.stderr,
    })
  }

  async fn terminate(&self) {
    self.alive.store(false, Ordering::SeqCst);
    self.worker.lock().await.kill().await;
  }
}
