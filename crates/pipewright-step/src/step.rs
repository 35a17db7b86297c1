//! The step contract.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};

use crate::error::StepError;
use crate::result::StepResult;

/// Envelopes produced by a streamed call. The last one is terminal.
pub type StepStream = BoxStream<'static, StepResult>;

/// A unit of work.
///
/// Input must be a JSON object; anything else yields a validation error
/// envelope. No method panics or returns `Err` on ordinary failure.
///
/// Steps never touch a shared context themselves. Recording outputs and
/// merging exported variables is done by the composition layer.
pub trait Step: Send + Sync + 'static {
  /// Kind tag, as used in step definitions.
  fn kind(&self) -> &'static str;

  /// Name under which the output is stored in the context.
  fn name(&self) -> Option<&str>;

  /// Run to completion, blocking the calling thread.
  fn execute(&self, input: &serde_json::Value) -> StepResult;

  /// Run to completion without blocking the async runtime.
  ///
  /// Defaults to running [`execute`](Step::execute) on the blocking pool.
  fn execute_async(self: Arc<Self>, input: serde_json::Value) -> BoxFuture<'static, StepResult> {
    Box::pin(async move {
      let kind = self.kind();
      match tokio::task::spawn_blocking(move || self.execute(&input)).await {
        Ok(result) => result,
        Err(e) => StepError::execution(format!("{} step worker failed: {}", kind, e)).into(),
      }
    })
  }

  /// Run, yielding intermediate envelopes as they are produced.
  ///
  /// Defaults to a single terminal envelope from
  /// [`execute_async`](Step::execute_async).
  fn execute_stream(self: Arc<Self>, input: serde_json::Value) -> StepStream {
    futures::stream::once(self.execute_async(input)).boxed()
  }
}

/// Borrow the input as an object, or fail validation.
pub(crate) fn require_object(
  input: &serde_json::Value,
) -> Result<&serde_json::Map<String, serde_json::Value>, StepError> {
  input.as_object().ok_or_else(|| {
    StepError::validation(format!(
      "step input must be a JSON object, got {}",
      json_type_name(input)
    ))
  })
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
  match value {
    serde_json::Value::Null => "null",
    serde_json::Value::Bool(_) => "a boolean",
    serde_json::Value::Number(_) => "a number",
    serde_json::Value::String(_) => "a string",
    serde_json::Value::Array(_) => "an array",
    serde_json::Value::Object(_) => "an object",
  }
}

/// Label for a step in history and output maps.
pub(crate) fn step_label(step: &dyn Step, index: usize) -> String {
  match step.name() {
    Some(name) => name.to_string(),
    None => format!("{}_{}", step.kind(), index),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  struct Echo;

  impl Step for Echo {
    fn kind(&self) -> &'static str {
      "echo"
    }

    fn name(&self) -> Option<&str> {
      None
    }

    fn execute(&self, input: &serde_json::Value) -> StepResult {
      match require_object(input) {
        Ok(map) => StepResult::success(serde_json::Value::Object(map.clone())),
        Err(e) => e.into(),
      }
    }
  }

  #[tokio::test]
  async fn test_default_async_offloads_execute() {
    let result = Arc::new(Echo).execute_async(json!({ "a": 1 })).await;

    assert!(result.is_success());
    assert_eq!(result.data, json!({ "a": 1 }));
  }

  #[tokio::test]
  async fn test_default_stream_yields_one_terminal_chunk() {
    let chunks: Vec<StepResult> = Arc::new(Echo).execute_stream(json!({})).collect().await;

    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].is_terminal());
  }

  #[test]
  fn test_non_object_input_is_validation_error() {
    let result = Echo.execute(&json!([1, 2]));

    assert!(result.is_error());
    assert_eq!(result.metadata["error_kind"], "validation");
    assert!(result.data.as_str().unwrap().contains("an array"));
  }

  #[test]
  fn test_step_label() {
    assert_eq!(step_label(&Echo, 3), "echo_3");
  }
}
