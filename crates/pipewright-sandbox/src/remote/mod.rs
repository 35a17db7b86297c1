//! Session-addressable remote execution.

mod process;
mod session;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::SandboxError;
use crate::export::{EXPORT_SNIPPET, condition_snippet, extract_exports, setup_snippet};

pub use process::{ProcessProviderConfig, ProcessSessionProvider};
pub use session::{
  CodeFailure, CodeOutput, CommandOutput, OutputEvent, OutputSink, OutputStream, ResolvedSession,
  Session, SessionProvider,
};

/// Lifetime requested for newly created sessions.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);
/// Ceiling on a single code cell or shell command.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);
/// Ceiling on a branch condition evaluation.
pub const CONDITION_TIMEOUT: Duration = Duration::from_secs(10);

const SHELL_PREFIX: char = '!';
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether `code` is a shell-command payload rather than Python.
///
/// Decided by the first non-blank line.
pub fn is_shell_payload(code: &str) -> bool {
  code
    .lines()
    .map(str::trim_start)
    .find(|line| !line.is_empty())
    .is_some_and(|line| line.starts_with(SHELL_PREFIX))
}

/// Outcome of one remote run.
///
/// `outcome` carries per-call failures, which leave the session usable.
/// `exports` is filled independently of `outcome`.
#[derive(Debug)]
pub struct RemoteRun {
  pub outcome: Result<(), SandboxError>,
  pub stdout: String,
  pub stderr: String,
  pub exports: serde_json::Map<String, serde_json::Value>,
}

impl RemoteRun {
  fn new() -> Self {
    Self {
      outcome: Ok(()),
      stdout: String::new(),
      stderr: String::new(),
      exports: serde_json::Map::new(),
    }
  }

  pub fn is_success(&self) -> bool {
    self.outcome.is_ok()
  }
}

/// Runs code in sessions obtained from a [`SessionProvider`].
#[derive(Clone)]
pub struct RemoteSandbox {
  provider: Arc<dyn SessionProvider>,
  session_timeout: Duration,
  call_timeout: Duration,
  return_global: Option<String>,
}

impl RemoteSandbox {
  pub fn new(provider: Arc<dyn SessionProvider>) -> Self {
    Self {
      provider,
      session_timeout: DEFAULT_SESSION_TIMEOUT,
      call_timeout: DEFAULT_CALL_TIMEOUT,
      return_global: None,
    }
  }

  /// Requested lifetime for sessions this sandbox creates. Capped at the
  /// provider's ceiling.
  pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
    self.session_timeout = timeout;
    self
  }

  pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
    self.call_timeout = timeout;
    self
  }

  /// Global that carries the code's return value.
  ///
  /// It is cleared before every Python run and never seeded from the
  /// context, so it is only exported when the code itself assigns it.
  pub fn with_return_global(mut self, name: impl Into<String>) -> Self {
    self.return_global = Some(name.into());
    self
  }

  pub fn provider(&self) -> &Arc<dyn SessionProvider> {
    &self.provider
  }

  /// Find the live session for `session_id` or create one.
  #[instrument(name = "resolve_session", skip(self))]
  pub async fn resolve_session(&self, session_id: &str) -> Result<Arc<dyn Session>, SandboxError> {
    let timeout = self.session_timeout.min(self.provider.max_timeout());
    let resolved = self
      .provider
      .find_or_create(session_id, timeout)
      .await
      .map_err(|e| match e {
        SandboxError::SessionInit { .. } => e,
        other => SandboxError::session_init(session_id, other.to_string()),
      })?;

    if resolved.created {
      info!(
        session_id = %session_id,
        timeout_secs = timeout.as_secs(),
        "session_created"
      );
    } else {
      debug!(session_id = %session_id, "session_reused");
    }
    Ok(resolved.session)
  }

  /// Run `code` in the session, with `context` injected as globals.
  ///
  /// Setup, code and export run under the session's run lock, so concurrent
  /// runs on one session never see each other's context. Only session
  /// resolution failures are returned as `Err`.
  #[instrument(name = "remote_sandbox_run", skip(self, code, context))]
  pub async fn run(
    &self,
    session_id: &str,
    code: &str,
    context: &serde_json::Map<String, serde_json::Value>,
  ) -> Result<RemoteRun, SandboxError> {
    let session = self.resolve_session(session_id).await?;
    let _run = session.run_lock().lock().await;

    if is_shell_payload(code) {
      return Ok(self.run_commands(session.as_ref(), code).await);
    }

    let mut run = RemoteRun::new();
    if let Err(e) = self.run_setup(session.as_ref(), context).await {
      run.outcome = Err(e);
      return Ok(run);
    }

    match session.run_code(code, None, self.call_timeout).await {
      Ok(output) => {
        run.stdout = output.stdout;
        run.stderr = output.stderr;
        if let Some(failure) = output.error {
          run.outcome = Err(SandboxError::execution(failure.to_string()));
        }
      }
      Err(e) => run.outcome = Err(e),
    }

    run.exports = self.capture_exports(session.as_ref()).await;
    Ok(run)
  }

  /// Like [`run`](Self::run), forwarding output to `on_output` as it is
  /// produced.
  ///
  /// Events arrive in production order, all before this returns. Shell
  /// payloads are not streamed; their output is delivered in one event per
  /// stream after the commands finish.
  #[instrument(name = "remote_sandbox_run_streaming", skip(self, code, context, on_output))]
  pub async fn run_streaming(
    &self,
    session_id: &str,
    code: &str,
    context: &serde_json::Map<String, serde_json::Value>,
    mut on_output: impl FnMut(OutputEvent) + Send,
  ) -> Result<RemoteRun, SandboxError> {
    let session = self.resolve_session(session_id).await?;
    let _run = session.run_lock().lock().await;

    if is_shell_payload(code) {
      let run = self.run_commands(session.as_ref(), code).await;
      if !run.stdout.is_empty() {
        on_output(OutputEvent::stdout(run.stdout.clone()));
      }
      if !run.stderr.is_empty() {
        on_output(OutputEvent::stderr(run.stderr.clone()));
      }
      return Ok(run);
    }

    let mut run = RemoteRun::new();
    if let Err(e) = self.run_setup(session.as_ref(), context).await {
      run.outcome = Err(e);
      return Ok(run);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = {
      let session = session.clone();
      let code = code.to_string();
      let timeout = self.call_timeout;
      tokio::spawn(async move { session.run_code(&code, Some(tx), timeout).await })
    };

    loop {
      match tokio::time::timeout(POLL_INTERVAL, rx.recv()).await {
        Ok(Some(event)) => on_output(event),
        Ok(None) => break,
        Err(_) if task.is_finished() => {
          while let Ok(event) = rx.try_recv() {
            on_output(event);
          }
          break;
        }
        Err(_) => {}
      }
    }

    match task.await {
      Ok(Ok(output)) => {
        run.stdout = output.stdout;
        run.stderr = output.stderr;
        if let Some(failure) = output.error {
          run.outcome = Err(SandboxError::execution(failure.to_string()));
        }
      }
      Ok(Err(e)) => run.outcome = Err(e),
      Err(e) => run.outcome = Err(SandboxError::execution(format!("execution task failed: {}", e))),
    }

    run.exports = self.capture_exports(session.as_ref()).await;
    Ok(run)
  }

  /// Evaluate a boolean Python expression against `context` alone.
  ///
  /// The session only hosts the evaluation; its globals are not visible to
  /// the expression. Fails closed: any error, timeout or output other than
  /// `true` is false.
  #[instrument(name = "evaluate_condition", skip(self, context))]
  pub async fn evaluate_condition(
    &self,
    session_id: &str,
    expression: &str,
    context: &serde_json::Map<String, serde_json::Value>,
  ) -> bool {
    let code = condition_snippet(expression, context);

    let session = match self.resolve_session(session_id).await {
      Ok(session) => session,
      Err(e) => {
        warn!(error = %e, "condition_session_failed");
        return false;
      }
    };
    let _run = session.run_lock().lock().await;

    match session.run_code(&code, None, CONDITION_TIMEOUT).await {
      Ok(output) if output.error.is_none() => {
        let admitted = output.stdout.trim().eq_ignore_ascii_case("true");
        debug!(admitted, "condition_evaluated");
        admitted
      }
      Ok(output) => {
        let failure = output.error.map(|f| f.to_string()).unwrap_or_default();
        debug!(error = %failure, "condition_raised");
        false
      }
      Err(e) => {
        warn!(error = %e, "condition_failed");
        false
      }
    }
  }

  async fn run_setup(
    &self,
    session: &dyn Session,
    context: &serde_json::Map<String, serde_json::Value>,
  ) -> Result<(), SandboxError> {
    let reset: Vec<&str> = self.return_global.as_deref().into_iter().collect();
    let Some(setup) = setup_snippet(context, &reset) else {
      return Ok(());
    };

    let output = session.run_code(&setup, None, self.call_timeout).await?;
    match output.error {
      Some(failure) => Err(SandboxError::execution(format!(
        "context setup failed: {}",
        failure
      ))),
      None => Ok(()),
    }
  }

  async fn run_commands(&self, session: &dyn Session, code: &str) -> RemoteRun {
    let mut run = RemoteRun::new();
    for line in code.lines() {
      let line = line.trim();
      if line.is_empty() {
        continue;
      }
      let command = line.strip_prefix(SHELL_PREFIX).unwrap_or(line).trim();
      if command.is_empty() {
        continue;
      }

      match session.run_command(command, self.call_timeout).await {
        Ok(output) => {
          run.stdout.push_str(&output.stdout);
          run.stderr.push_str(&output.stderr);
          if output.exit_code != 0 {
            warn!(command = %command, exit_code = output.exit_code, "command_failed");
            run.outcome = Err(SandboxError::CommandFailed {
              command: command.to_string(),
              exit_code: output.exit_code,
              stderr: output.stderr,
            });
            break;
          }
        }
        Err(e) => {
          run.outcome = Err(e);
          break;
        }
      }
    }
    run
  }

  /// Best-effort: every failure degrades to an empty map.
  async fn capture_exports(
    &self,
    session: &dyn Session,
  ) -> serde_json::Map<String, serde_json::Value> {
    if !session.is_alive() {
      return serde_json::Map::new();
    }

    let stdout = match session.run_code(EXPORT_SNIPPET, None, self.call_timeout).await {
      Ok(output) => output.stdout,
      Err(e) => {
        warn!(error = %e, "export_capture_failed");
        return serde_json::Map::new();
      }
    };

    extract_exports(&stdout).unwrap_or_else(|e| {
      warn!(error = %e, "export_decode_failed");
      serde_json::Map::new()
    })
  }
}
