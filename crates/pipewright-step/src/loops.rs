//! Iteration over a list or a repeat count.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use pipewright_config::{ExecutionMode, FailureMode, LoopCount};
use pipewright_template::TemplateResolver;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::bridge;
use crate::chain::{Sequence, data_text, run_sequence};
use crate::error::StepError;
use crate::events::{ExecutionNotifier, NoopNotifier};
use crate::result::StepResult;
use crate::step::{Step, require_object};

/// Default bound on iterations per run.
pub const DEFAULT_MAX_ITERATIONS: usize = 10_000;

/// How the iterations are produced.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopSource {
  /// Template rendering to a list; one iteration per element.
  Map(String),
  /// Literal or template rendering to a positive integer.
  Repeat(LoopCount),
}

/// Runs its body once per iteration and collects each iteration's final
/// value, in iteration order.
///
/// Iteration input is the loop input extended with `index`, `count` and,
/// in map mode, `item`. The body runs with chain semantics over a context
/// private to the iteration.
///
/// In parallel mode at most `concurrency` iterations run at once; in
/// sequential mode one. Iteration *i*'s value is always at index *i*.
#[derive(Clone)]
pub struct LoopStep {
  name: Option<String>,
  source: LoopSource,
  body: Vec<Arc<dyn Step>>,
  execution_mode: ExecutionMode,
  concurrency: usize,
  failure_mode: FailureMode,
  max_iterations: usize,
  notifier: Arc<dyn ExecutionNotifier>,
  resolver: TemplateResolver,
}

enum Iteration {
  Completed(StepResult),
  Skipped,
}

impl LoopStep {
  pub fn new(name: Option<String>, source: LoopSource, body: Vec<Arc<dyn Step>>) -> Self {
    Self {
      name,
      source,
      body,
      execution_mode: ExecutionMode::Sequential,
      concurrency: 1,
      failure_mode: FailureMode::StopAndFail,
      max_iterations: DEFAULT_MAX_ITERATIONS,
      notifier: Arc::new(NoopNotifier),
      resolver: TemplateResolver::new(),
    }
  }

  /// Run up to `concurrency` iterations at once.
  pub fn parallel(mut self, concurrency: usize) -> Self {
    self.execution_mode = ExecutionMode::Parallel;
    self.concurrency = concurrency.max(1);
    self
  }

  pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
    self.failure_mode = failure_mode;
    self
  }

  /// Reject runs that would produce more than `max_iterations` iterations.
  pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
    self.max_iterations = max_iterations;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  fn label(&self) -> String {
    self.name.clone().unwrap_or_else(|| "loop".to_string())
  }

  fn permits(&self) -> usize {
    match self.execution_mode {
      ExecutionMode::Sequential => 1,
      ExecutionMode::Parallel => self.concurrency.max(1),
    }
  }

  fn too_many(&self, count: impl std::fmt::Display) -> StepError {
    StepError::configuration(
      self.label(),
      format!(
        "loop would run {} iterations, more than the limit of {}",
        count, self.max_iterations
      ),
    )
  }

  /// Per-iteration items. `None` entries are repeat iterations.
  fn iterations(
    &self,
    input: &serde_json::Value,
  ) -> Result<Vec<Option<serde_json::Value>>, StepError> {
    match &self.source {
      LoopSource::Map(template) => match self.resolver.render_value(template, input) {
        serde_json::Value::Array(items) if items.len() > self.max_iterations => {
          Err(self.too_many(items.len()))
        }
        serde_json::Value::Array(items) => Ok(items.into_iter().map(Some).collect()),
        other => Err(StepError::configuration(
          self.label(),
          format!("map source must render to a list, got {}", other),
        )),
      },
      LoopSource::Repeat(count) => {
        let value = match count {
          LoopCount::Literal(n) => serde_json::Value::from(*n),
          LoopCount::Template(template) => self.resolver.render_value(template, input),
        };
        let count = match &value {
          serde_json::Value::Number(n) => n.as_i64(),
          serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
          _ => None,
        };
        match count {
          Some(n) if n > 0 && n as u64 > self.max_iterations as u64 => Err(self.too_many(n)),
          Some(n) if n > 0 => Ok(vec![None; n as usize]),
          _ => Err(StepError::configuration(
            self.label(),
            format!("loop count must be a positive integer, got {}", value),
          )),
        }
      }
    }
  }

  #[instrument(name = "loop_execute", skip(self, input), fields(step = %self.label()))]
  async fn run(&self, input: serde_json::Value) -> StepResult {
    let base = match require_object(&input) {
      Ok(map) => map,
      Err(e) => return e.into(),
    };
    let items = match self.iterations(&input) {
      Ok(items) => items,
      Err(e) => return e.into(),
    };

    let count = items.len();
    let permits = self.permits();
    info!(count, permits, "loop_started");

    let semaphore = Semaphore::new(permits);
    let failed = AtomicBool::new(false);
    let execution_id = uuid::Uuid::new_v4().to_string();

    let iterations = items.into_iter().enumerate().map(|(index, item)| {
      let semaphore = &semaphore;
      let failed = &failed;
      let execution_id = &execution_id;
      async move {
        let Ok(_permit) = semaphore.acquire().await else {
          return Iteration::Skipped;
        };
        if self.failure_mode == FailureMode::StopAndFail && failed.load(Ordering::SeqCst) {
          debug!(index, "iteration_skipped");
          return Iteration::Skipped;
        }

        let mut iteration_input = base.clone();
        iteration_input.insert("index".to_string(), index.into());
        iteration_input.insert("count".to_string(), count.into());
        if let Some(item) = item {
          iteration_input.insert("item".to_string(), item);
        }

        let outcome = run_sequence(
          Sequence {
            steps: &self.body,
            failure_mode: FailureMode::StopAndFail,
            notifier: self.notifier.as_ref(),
            execution_id,
          },
          &iteration_input,
        )
        .await;

        let result = match outcome.failure_message() {
          None => StepResult::success(outcome.last_data()),
          Some(message) => {
            failed.store(true, Ordering::SeqCst);
            warn!(index, error = %message, "iteration_failed");
            StepResult::error(message)
          }
        };
        Iteration::Completed(result.with_metadata("index", index))
      }
    });

    let results = futures::future::join_all(iterations).await;
    self.collect(results)
  }

  fn collect(&self, results: Vec<Iteration>) -> StepResult {
    let mut data = Vec::with_capacity(results.len());
    let mut envelopes = Vec::with_capacity(results.len());
    let mut first_failure: Option<(usize, String)> = None;
    let mut skipped = 0usize;

    for (index, iteration) in results.into_iter().enumerate() {
      match iteration {
        Iteration::Completed(result) => {
          if result.is_error() && first_failure.is_none() {
            first_failure = Some((index, data_text(&result.data)));
          }
          data.push(result.data.clone());
          envelopes.push(result.to_value());
        }
        Iteration::Skipped => {
          skipped += 1;
          data.push(serde_json::Value::Null);
          envelopes.push(serde_json::Value::Null);
        }
      }
    }

    match first_failure {
      None => {
        info!(count = data.len(), "loop_completed");
        StepResult::success(data).with_metadata("count", envelopes.len())
      }
      Some((index, message)) => {
        warn!(index, skipped, "loop_failed");
        StepResult::error(format!("iteration {} failed: {}", index, message))
          .with_metadata("error_kind", "execution")
          .with_metadata("iterations", envelopes)
          .with_metadata("skipped", skipped)
      }
    }
  }
}

impl Step for LoopStep {
  fn kind(&self) -> &'static str {
    "loop"
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
