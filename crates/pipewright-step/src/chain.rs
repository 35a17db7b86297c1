//! Sequential composition.

use std::sync::Arc;

use futures::future::BoxFuture;
use pipewright_config::FailureMode;
use tracing::{error, info, instrument, warn};

use crate::bridge;
use crate::context::Context;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::result::StepResult;
use crate::step::{Step, require_object, step_label};

/// Runs steps in declared order over one shared [`Context`].
///
/// Step *n* receives the invocation input overlaid with every output and
/// exported variable recorded by steps 1..n-1. After each step:
/// - a named step's `data` is stored under its name and appended to the
///   history
/// - its exported variables are flat-merged, with a `<name>_str` alias
/// - a truthy `early_return` in the context stops the sequence
///
/// Success data is `{chain_output, all_steps_output, history}`. When a step
/// fails, the envelope is an error naming the failing step, with the same
/// three fields in its metadata. Under [`FailureMode::Continue`] the
/// remaining steps still run, but the chain still reports an error.
#[derive(Clone)]
pub struct Chain {
  name: Option<String>,
  steps: Vec<Arc<dyn Step>>,
  failure_mode: FailureMode,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl Chain {
  pub fn new(name: Option<String>, steps: Vec<Arc<dyn Step>>) -> Self {
    Self {
      name,
      steps,
      failure_mode: FailureMode::StopAndFail,
      notifier: Arc::new(NoopNotifier),
    }
  }

  pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
    self.failure_mode = failure_mode;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn steps(&self) -> &[Arc<dyn Step>] {
    &self.steps
  }

  fn label(&self) -> String {
    self.name.clone().unwrap_or_else(|| "chain".to_string())
  }

  #[instrument(name = "chain_execute", skip(self, input), fields(chain = %self.label(), steps = self.steps.len()))]
  async fn run(&self, input: serde_json::Value) -> StepResult {
    let input = match require_object(&input) {
      Ok(map) => map,
      Err(e) => return e.into(),
    };

    let execution_id = uuid::Uuid::new_v4().to_string();
    let chain = self.label();
    info!(execution_id = %execution_id, "chain_started");
    self.notifier.notify(ExecutionEvent::ChainStarted {
      execution_id: execution_id.clone(),
      chain: chain.clone(),
    });

    let outcome = run_sequence(
      Sequence {
        steps: &self.steps,
        failure_mode: self.failure_mode,
        notifier: self.notifier.as_ref(),
        execution_id: &execution_id,
      },
      input,
    )
    .await;

    let result = outcome.into_result().with_metadata("execution_id", execution_id.clone());
    if result.is_success() {
      info!(execution_id = %execution_id, "chain_completed");
      self.notifier.notify(ExecutionEvent::ChainCompleted {
        execution_id,
        chain,
      });
    } else {
      error!(execution_id = %execution_id, error = %result.data, "chain_failed");
      self.notifier.notify(ExecutionEvent::ChainFailed {
        execution_id,
        chain,
        error: data_text(&result.data),
      });
    }
    result
  }
}

impl Step for Chain {
  fn kind(&self) -> &'static str {
    "chain"
  }

  fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  fn execute(&self, input: &serde_json::Value) -> StepResult {
    bridge::block_on(Arc::new(self.clone()).execute_async(input.clone()))
  }

  fn execute_async(self: Arc<Self>, input: serde_json::Value) -> BoxFuture<'static, StepResult> {
    Box::pin(async move { self.run(input).await })
  }
}

/// A step sequence and how to run it.
pub(crate) struct Sequence<'a> {
  pub steps: &'a [Arc<dyn Step>],
  pub failure_mode: FailureMode,
  pub notifier: &'a dyn ExecutionNotifier,
  pub execution_id: &'a str,
}

/// Everything a finished sequence produced.
pub(crate) struct SequenceOutcome {
  pub context: Context,
  pub last: Option<StepResult>,
  /// Envelope per step label.
  pub outputs: serde_json::Map<String, serde_json::Value>,
  /// Exported variables merged during the sequence.
  pub exports: serde_json::Map<String, serde_json::Value>,
  pub failures: Vec<(String, StepResult)>,
  pub early_return: bool,
}

impl SequenceOutcome {
  /// `{chain_output, all_steps_output, history}`.
  pub fn summary(&self) -> serde_json::Value {
    serde_json::json!({
      "chain_output": self.last.as_ref().map(StepResult::to_value),
      "all_steps_output": self.outputs,
      "history": self.context.history_value(),
    })
  }

  /// The final step's data, or null for an empty sequence.
  pub fn last_data(&self) -> serde_json::Value {
    self
      .last
      .as_ref()
      .map(|r| r.data.clone())
      .unwrap_or_default()
  }

  /// Error text naming the failed steps, when any failed.
  pub fn failure_message(&self) -> Option<String> {
    let (first_label, first) = self.failures.first()?;
    let message = if self.failures.len() == 1 {
      format!("step '{}' failed: {}", first_label, data_text(&first.data))
    } else {
      let labels: Vec<String> = self
        .failures
        .iter()
        .map(|(label, _)| format!("'{}'", label))
        .collect();
      format!(
        "steps {} failed; first: {}",
        labels.join(", "),
        data_text(&first.data)
      )
    };
    Some(message)
  }

  /// Chain envelope for this outcome.
  pub fn into_result(self) -> StepResult {
    let summary = self.summary();
    let result = match self.failure_message() {
      None => StepResult::success(summary).with_metadata("early_return", self.early_return),
      Some(message) => {
        let failed: Vec<serde_json::Value> = self
          .failures
          .iter()
          .map(|(label, _)| serde_json::Value::String(label.clone()))
          .collect();
        let mut result = StepResult::error(message).with_metadata("failed_steps", failed);
        if let serde_json::Value::Object(fields) = summary {
          result.metadata.extend(fields);
        }
        if let Some(kind) = self
          .failures
          .first()
          .and_then(|(_, r)| r.metadata.get("error_kind"))
        {
          result.metadata.insert("error_kind".to_string(), kind.clone());
        }
        result
      }
    };
    result.with_exported_variables(self.exports)
  }
}

/// Run `steps` in order against a fresh context seeded from `input`.
pub(crate) async fn run_sequence(
  sequence: Sequence<'_>,
  input: &serde_json::Map<String, serde_json::Value>,
) -> SequenceOutcome {
  let mut outcome = SequenceOutcome {
    context: Context::new(),
    last: None,
    outputs: serde_json::Map::new(),
    exports: serde_json::Map::new(),
    failures: Vec::new(),
    early_return: false,
  };

  for (index, step) in sequence.steps.iter().enumerate() {
    let label = step_label(step.as_ref(), index);
    let kind = step.kind();
    info!(step = %label, kind, "step_started");
    sequence.notifier.notify(ExecutionEvent::StepStarted {
      execution_id: sequence.execution_id.to_string(),
      step: label.clone(),
    });

    let step_input = outcome.context.step_input(input);
    let result = step.clone().execute_async(step_input).await;

    match step.name() {
      Some(name) => outcome.context.record(name, kind, &result),
      None => outcome.context.push_history(&label, kind, &result),
    }

    let exports = result.exported_variables();
    if !exports.is_empty() {
      outcome.context.merge_exports(&exports);
      outcome.exports.extend(exports);
    }
    outcome.outputs.insert(label.clone(), result.to_value());

    let failed = result.is_error();
    if failed {
      warn!(step = %label, error = %result.data, "step_failed");
      sequence.notifier.notify(ExecutionEvent::StepFailed {
        execution_id: sequence.execution_id.to_string(),
        step: label.clone(),
        error: data_text(&result.data),
      });
      outcome.failures.push((label, result.clone()));
    } else {
      info!(step = %label, "step_completed");
      sequence.notifier.notify(ExecutionEvent::StepCompleted {
        execution_id: sequence.execution_id.to_string(),
        step: label,
        data: result.data.clone(),
      });
    }
    outcome.last = Some(result);

    if failed && sequence.failure_mode == FailureMode::StopAndFail {
      break;
    }
    if outcome.context.early_return() {
      info!(step_index = index, "early_return");
      outcome.early_return = true;
      break;
    }
  }

  outcome
}

/// Error data as text: strings verbatim, anything else as JSON.
pub(crate) fn data_text(data: &serde_json::Value) -> String {
  match data {
    serde_json::Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}
