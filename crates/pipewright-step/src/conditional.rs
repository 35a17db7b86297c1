//! Branching on sandbox-evaluated conditions.

use std::sync::Arc;

use futures::future::BoxFuture;
use pipewright_config::{BranchCondition, FailureMode};
use pipewright_sandbox::RemoteSandbox;
use tracing::{info, instrument};

use crate::bridge;
use crate::chain::{Sequence, run_sequence};
use crate::error::StepError;
use crate::events::{ExecutionNotifier, NoopNotifier};
use crate::result::StepResult;
use crate::step::{Step, require_object};

/// One guarded sub-sequence.
#[derive(Clone)]
pub struct Branch {
  pub condition: BranchCondition,
  pub steps: Vec<Arc<dyn Step>>,
}

/// Runs exactly one branch: the first whose condition holds, else the
/// `else` branch.
///
/// Conditions are Python expressions evaluated as `bool(<condition>)`
/// against the input alone, hosted by a remote session. Anything but a clean
/// `True` counts as false, so a name missing from the input fails the branch. With no matching branch and no `else`, the result is an error.
///
/// Data is the last step's data of the branch that ran. The branch index,
/// its outputs and history are in metadata.
#[derive(Clone)]
pub struct ConditionalStep {
  name: Option<String>,
  branches: Vec<Branch>,
  sandbox: RemoteSandbox,
  session_id: Option<String>,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl ConditionalStep {
  pub fn new(name: Option<String>, branches: Vec<Branch>, sandbox: RemoteSandbox) -> Self {
    Self {
      name,
      branches,
      sandbox,
      session_id: None,
      notifier: Arc::new(NoopNotifier),
    }
  }

  /// Session used for condition evaluation. Defaults to one derived from
  /// the step name.
  pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
    self.session_id = Some(session_id.into());
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  fn label(&self) -> String {
    self.name.clone().unwrap_or_else(|| "conditional".to_string())
  }

  fn session_id(&self) -> String {
    self
      .session_id
      .clone()
      .unwrap_or_else(|| format!("pipewright-{}-conditions", self.label()))
  }

  /// Index of the branch to run.
  async fn select(
    &self,
    input: &serde_json::Map<String, serde_json::Value>,
  ) -> Option<usize> {
    let session_id = self.session_id();
    for (index, branch) in self.branches.iter().enumerate() {
      match &branch.condition {
        BranchCondition::Else => return Some(index),
        BranchCondition::Expression(expression) => {
          if self
            .sandbox
            .evaluate_condition(&session_id, expression, input)
            .await
          {
            return Some(index);
          }
        }
      }
    }
    None
  }

  #[instrument(name = "conditional_execute", skip(self, input), fields(step = %self.label()))]
  async fn run(&self, input: serde_json::Value) -> StepResult {
    let input = match require_object(&input) {
      Ok(map) => map,
      Err(e) => return e.into(),
    };

    let Some(index) = self.select(input).await else {
      info!("no_branch_matched");
      return StepError::execution("no matching branch").into();
    };
    let branch = &self.branches[index];
    let condition = String::from(branch.condition.clone());
    info!(branch = index, condition = %condition, "branch_selected");

    let execution_id = uuid::Uuid::new_v4().to_string();
    let outcome = run_sequence(
      Sequence {
        steps: &branch.steps,
        failure_mode: FailureMode::StopAndFail,
        notifier: self.notifier.as_ref(),
        execution_id: &execution_id,
      },
      input,
    )
    .await;

    let result = match outcome.failure_message() {
      None => StepResult::success(outcome.last_data()),
      Some(message) => {
        let mut result = StepResult::error(message);
        if let Some(kind) = outcome
          .failures
          .first()
          .and_then(|(_, r)| r.metadata.get("error_kind"))
        {
          result.metadata.insert("error_kind".to_string(), kind.clone());
        }
        result
      }
    };

    result
      .with_metadata("branch", index)
      .with_metadata("condition", condition)
      .with_metadata("all_steps_output", outcome.outputs.clone())
      .with_metadata("history", outcome.context.history_value())
      .with_exported_variables(outcome.exports)
  }
}

impl Step for ConditionalStep {
  fn kind(&self) -> &'static str {
    "conditional"
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

#[cfg(test)]
mod tests {
  use super::*;
  use crate::template_step::TemplateStep;
  use pipewright_sandbox::testing::{ScriptedProvider, ScriptedReply};
  use serde_json::json;

  fn branch(condition: BranchCondition, output: serde_json::Value) -> Branch {
    Branch {
      condition,
      steps: vec![Arc::new(TemplateStep::new(Some("out".to_string()), output))],
    }
  }

  fn expression(text: &str) -> BranchCondition {
    BranchCondition::Expression(text.to_string())
  }

  #[tokio::test]
  async fn test_else_runs_when_conditions_fail() {
    let provider = Arc::new(
      ScriptedProvider::new().reply("eval(\"flag\"", ScriptedReply::new().stdout("False\n")),
    );
    let step = Arc::new(ConditionalStep::new(
      Some("route".to_string()),
      vec![
        branch(expression("flag"), json!("first")),
        branch(BranchCondition::Else, json!("fallback {{ who }}")),
      ],
      RemoteSandbox::new(provider.clone()),
    ));

    let result = step.execute_async(json!({ "who": "ada" })).await;

    assert!(result.is_success());
    assert_eq!(result.data, json!("fallback ada"));
    assert_eq!(result.metadata["branch"], json!(1));
    assert_eq!(provider.calls("pipewright-route-conditions").len(), 1);
  }

  #[tokio::test]
  async fn test_raising_condition_fails_closed() {
    let provider = Arc::new(ScriptedProvider::new().reply(
      "eval(",
      ScriptedReply::new().raise("NameError", "name 'x' is not defined"),
    ));
    let step = Arc::new(ConditionalStep::new(
      None,
      vec![branch(expression("x > 1"), json!("never"))],
      RemoteSandbox::new(provider),
    ));

    let result = step.execute_async(json!({})).await;

    assert!(!result.is_success());
    assert_eq!(result.data, json!("no matching branch"));
  }

  #[tokio::test]
  async fn test_explicit_session_id() {
    let provider = Arc::new(
      ScriptedProvider::new().reply("eval(\"ready\"", ScriptedReply::new().stdout("TRUE")),
    );
    let step = Arc::new(
      ConditionalStep::new(
        None,
        vec![branch(expression("ready"), json!(7))],
        RemoteSandbox::new(provider.clone()),
      )
      .with_session_id("shared-conditions"),
    );

    let result = step.execute_async(json!({ "ready": true })).await;

    assert_eq!(result.data, json!(7));
    assert_eq!(result.metadata["condition"], json!("ready"));
    assert!(!provider.calls("shared-conditions").is_empty());
  }
}
