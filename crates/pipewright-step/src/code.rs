//! Code execution step over the local or remote sandbox.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::StreamExt;
use pipewright_config::{CodeExecutionDef, ExecutionVariant, SandboxBackend};
use pipewright_sandbox::{LocalSandbox, OutputEvent, OutputStream, RemoteRun, RemoteSandbox};
use pipewright_template::TemplateResolver;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, instrument, warn};

use crate::bridge;
use crate::error::StepError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::result::StepResult;
use crate::step::{Step, StepStream, require_object};

/// Global read as the return value of remote code. Cleared before each run.
const RESULT_GLOBAL: &str = "result";

/// Runs user code.
///
/// Local code is Lua, called through its `main(input)` entry point. Remote
/// code is Python (or `!`-prefixed shell commands) run in a session whose
/// globals are seeded from the input and whose exportable globals are
/// reported in `metadata.exported_variables`.
#[derive(Clone)]
pub struct CodeExecutionStep {
  name: Option<String>,
  def: CodeExecutionDef,
  local: LocalSandbox,
  remote: Option<RemoteSandbox>,
  notifier: Arc<dyn ExecutionNotifier>,
  resolver: TemplateResolver,
}

impl CodeExecutionStep {
  /// Create a step. `remote` is required for the remote backend.
  pub fn new(
    name: Option<String>,
    def: CodeExecutionDef,
    local: LocalSandbox,
    remote: Option<RemoteSandbox>,
  ) -> Result<Self, StepError> {
    if def.backend == SandboxBackend::Remote && remote.is_none() {
      return Err(StepError::configuration(
        name.as_deref().unwrap_or("code_execution"),
        "remote backend requires a session provider",
      ));
    }
    if def.code.trim().is_empty() {
      return Err(StepError::configuration(
        name.as_deref().unwrap_or("code_execution"),
        "code must not be empty",
      ));
    }

    Ok(Self {
      name,
      def,
      local,
      remote,
      notifier: Arc::new(NoopNotifier),
      resolver: TemplateResolver::new(),
    })
  }

  /// Report captured output to `notifier`.
  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  fn label(&self) -> String {
    self.name.clone().unwrap_or_else(|| "code_execution".to_string())
  }

  fn timeout(&self) -> Option<Duration> {
    self.def.timeout_ms.map(Duration::from_millis)
  }

  fn session_id(&self, input: &serde_json::Value) -> String {
    match &self.def.session_id {
      Some(template) => self.resolver.render_str(template, input),
      None => format!("pipewright-{}", self.label()),
    }
  }

  fn remote_sandbox(&self) -> Result<RemoteSandbox, StepError> {
    let sandbox = self.remote.clone().ok_or_else(|| {
      StepError::configuration(self.label(), "remote backend requires a session provider")
    })?;
    let sandbox = match self.timeout() {
      Some(timeout) => sandbox.with_call_timeout(timeout),
      None => sandbox,
    };
    Ok(match self.def.variant {
      ExecutionVariant::ReturnValue => sandbox.with_return_global(RESULT_GLOBAL),
      ExecutionVariant::Stdout => sandbox,
    })
  }

  #[instrument(name = "code_step_local", skip(self, input), fields(step = %self.label()))]
  fn run_local(&self, input: &serde_json::Value) -> StepResult {
    if let Err(e) = require_object(input) {
      return e.into();
    }

    match self
      .local
      .execute(&self.def.code, input, self.def.variant, self.timeout())
    {
      Ok(output) => {
        if !output.stdout.is_empty() {
          self.notify_output(OutputEvent::stdout(output.stdout.clone()));
        }
        StepResult::success(output.value)
          .with_metadata("backend", "local")
          .with_metadata("stdout", output.stdout)
      }
      Err(e) => {
        warn!(error = %e, "code_execution_failed");
        StepResult::from(StepError::from(e)).with_metadata("backend", "local")
      }
    }
  }

  #[instrument(name = "code_step_remote", skip(self, input), fields(step = %self.label()))]
  async fn run_remote(&self, input: serde_json::Value) -> StepResult {
    let map = match require_object(&input) {
      Ok(map) => map,
      Err(e) => return e.into(),
    };
    let sandbox = match self.remote_sandbox() {
      Ok(sandbox) => sandbox,
      Err(e) => return e.into(),
    };
    let session_id = self.session_id(&input);

    match sandbox.run(&session_id, &self.def.code, map).await {
      Ok(run) => {
        if !run.stdout.is_empty() {
          self.notify_output(OutputEvent::stdout(run.stdout.clone()));
        }
        if !run.stderr.is_empty() {
          self.notify_output(OutputEvent::stderr(run.stderr.clone()));
        }
        self.remote_result(session_id, run)
      }
      Err(e) => {
        warn!(session_id = %session_id, error = %e, "sandbox_session_failed");
        StepError::from(e).into()
      }
    }
  }

  /// Run remotely, sending one `in_progress` envelope per output line to
  /// `chunks`. Returns the terminal envelope.
  async fn stream_remote(
    &self,
    input: serde_json::Value,
    chunks: &mpsc::UnboundedSender<StepResult>,
  ) -> StepResult {
    let map = match require_object(&input) {
      Ok(map) => map,
      Err(e) => return e.into(),
    };
    let sandbox = match self.remote_sandbox() {
      Ok(sandbox) => sandbox,
      Err(e) => return e.into(),
    };
    let session_id = self.session_id(&input);

    let mut lines = LineBuffer::default();
    let emit = |stream: OutputStream, text: String| {
      let chunk = StepResult::in_progress(text).with_metadata("stream", stream_name(stream));
      let _ = chunks.send(chunk);
    };

    let run = sandbox
      .run_streaming(&session_id, &self.def.code, map, |event| {
        self.notify_output(event.clone());
        for (stream, line) in lines.push(event) {
          emit(stream, line);
        }
      })
      .await;

    for (stream, rest) in lines.finish() {
      emit(stream, rest);
    }

    match run {
      Ok(run) => self.remote_result(session_id, run),
      Err(e) => StepError::from(e).into(),
    }
  }

  fn remote_result(&self, session_id: String, run: RemoteRun) -> StepResult {
    let RemoteRun {
      outcome,
      stdout,
      stderr,
      exports,
    } = run;

    let result = match outcome {
      Ok(()) => {
        let data = match self.def.variant {
          ExecutionVariant::ReturnValue => exports
            .get(RESULT_GLOBAL)
            .cloned()
            .unwrap_or_else(|| stdout_value(&stdout)),
          ExecutionVariant::Stdout => stdout_value(&stdout),
        };
        debug!(session_id = %session_id, exports = exports.len(), "code_execution_completed");
        StepResult::success(data)
      }
      Err(e) => {
        warn!(session_id = %session_id, error = %e, "code_execution_failed");
        StepError::from(e).into()
      }
    };

    result
      .with_metadata("backend", "remote")
      .with_metadata("session_id", session_id)
      .with_metadata("stdout", stdout)
      .with_metadata("stderr", stderr)
      .with_exported_variables(exports)
  }

  fn notify_output(&self, event: OutputEvent) {
    self.notifier.notify(ExecutionEvent::SandboxOutput {
      step: self.label(),
      stream: event.stream,
      text: event.text,
    });
  }
}

impl Step for CodeExecutionStep {
  fn kind(&self) -> &'static str {
    "code_execution"
  }

  fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  fn execute(&self, input: &serde_json::Value) -> StepResult {
    match self.def.backend {
      SandboxBackend::Local => self.run_local(input),
      SandboxBackend::Remote => {
        bridge::block_on(Arc::new(self.clone()).execute_async(input.clone()))
      }
    }
  }

  fn execute_async(self: Arc<Self>, input: serde_json::Value) -> BoxFuture<'static, StepResult> {
    Box::pin(async move {
      match self.def.backend {
        SandboxBackend::Remote => self.run_remote(input).await,
        SandboxBackend::Local => {
          let label = self.label();
          match tokio::task::spawn_blocking(move || self.run_local(&input)).await {
            Ok(result) => result,
            Err(e) => StepError::execution(format!("step '{}' worker failed: {}", label, e)).into(),
          }
        }
      }
    })
  }

  fn execute_stream(self: Arc<Self>, input: serde_json::Value) -> StepStream {
    if self.def.backend != SandboxBackend::Remote || !self.def.stream {
      return futures::stream::once(self.execute_async(input)).boxed();
    }

    futures::stream::once(async move {
      let (tx, rx) = mpsc::unbounded_channel();
      tokio::spawn(async move {
        let terminal = self.stream_remote(input, &tx).await;
        let _ = tx.send(terminal);
      });
      UnboundedReceiverStream::new(rx)
    })
    .flatten()
    .boxed()
  }
}

/// Remote stdout as step data: trailing newlines removed.
fn stdout_value(stdout: &str) -> serde_json::Value {
  serde_json::Value::String(stdout.trim_end_matches(['\n', '\r']).to_string())
}

fn stream_name(stream: OutputStream) -> &'static str {
  match stream {
    OutputStream::Stdout => "stdout",
    OutputStream::Stderr => "stderr",
    OutputStream::Error => "error",
  }
}

/// Splits streamed output into complete lines, per stream.
#[derive(Default)]
struct LineBuffer {
  stdout: String,
  stderr: String,
}

impl LineBuffer {
  fn push(&mut self, event: OutputEvent) -> Vec<(OutputStream, String)> {
    let buffer = match event.stream {
      OutputStream::Stdout => &mut self.stdout,
      OutputStream::Stderr => &mut self.stderr,
      OutputStream::Error => return vec![(OutputStream::Error, event.text)],
    };
    buffer.push_str(&event.text);

    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
      let rest = buffer.split_off(pos + 1);
      lines.push((event.stream, std::mem::replace(buffer, rest)));
    }
    lines
  }

  fn finish(self) -> Vec<(OutputStream, String)> {
    [
      (OutputStream::Stdout, self.stdout),
      (OutputStream::Stderr, self.stderr),
    ]
    .into_iter()
    .filter(|(_, rest)| !rest.is_empty())
    .collect()
  }
}
