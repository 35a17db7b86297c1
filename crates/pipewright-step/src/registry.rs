//! Builds steps from their definitions.
//!
//! Each step kind registers a builder under its `type` tag. Composite
//! builders recurse through the registry for their children, so a kind
//! registered later is usable inside chains, branches and loop bodies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pipewright_config::{
  ChainDef, CodeExecutionDef, CompletionDef, ConditionalDef, ExecutionMode, LoopDef, LoopMode,
  PipelineDef, StepDef, TemplateDef,
};
use pipewright_sandbox::{CapabilityPolicy, LocalSandbox, RemoteSandbox, SessionProvider};
use tracing::debug;

use crate::chain::Chain;
use crate::code::CodeExecutionStep;
use crate::completion::{CompletionService, CompletionStep};
use crate::conditional::{Branch, ConditionalStep};
use crate::error::StepError;
use crate::events::{ExecutionNotifier, NoopNotifier};
use crate::loops::{LoopSource, LoopStep};
use crate::step::Step;
use crate::template_step::TemplateStep;

/// Shared collaborators handed to every builder.
#[derive(Clone)]
pub struct Services {
  /// Backend for remote code and conditions. Without one, remote steps and
  /// conditionals fail to build.
  pub session_provider: Option<Arc<dyn SessionProvider>>,
  /// Lifetime requested for new remote sessions.
  pub session_timeout: Option<Duration>,
  pub policy: CapabilityPolicy,
  pub completion: Option<Arc<dyn CompletionService>>,
  pub notifier: Arc<dyn ExecutionNotifier>,
}

impl Default for Services {
  fn default() -> Self {
    Self {
      session_provider: None,
      session_timeout: None,
      policy: CapabilityPolicy::default(),
      completion: None,
      notifier: Arc::new(NoopNotifier),
    }
  }
}

impl Services {
  pub fn with_session_provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
    self.session_provider = Some(provider);
    self
  }

  pub fn with_completion(mut self, completion: Arc<dyn CompletionService>) -> Self {
    self.completion = Some(completion);
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn with_policy(mut self, policy: CapabilityPolicy) -> Self {
    self.policy = policy;
    self
  }

  fn remote_sandbox(&self) -> Option<RemoteSandbox> {
    let provider = self.session_provider.clone()?;
    let sandbox = RemoteSandbox::new(provider);
    Some(match self.session_timeout {
      Some(timeout) => sandbox.with_session_timeout(timeout),
      None => sandbox,
    })
  }
}

/// Builds one step kind.
pub type StepBuilder =
  Arc<dyn Fn(&StepDef, &StepRegistry, &Services) -> Result<Arc<dyn Step>, StepError> + Send + Sync>;

/// Step factory keyed by `type` tag.
#[derive(Clone)]
pub struct StepRegistry {
  builders: HashMap<String, StepBuilder>,
}

impl Default for StepRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl StepRegistry {
  /// A registry with every built-in kind.
  pub fn new() -> Self {
    let mut registry = Self::empty();
    registry.register("code_execution", build_code_execution);
    registry.register("template", build_template);
    registry.register("completion", build_completion);
    registry.register("chain", build_chain);
    registry.register("conditional", build_conditional);
    registry.register("loop", build_loop);
    registry
  }

  pub fn empty() -> Self {
    Self {
      builders: HashMap::new(),
    }
  }

  /// Register (or replace) the builder for `kind`.
  pub fn register<F>(&mut self, kind: &str, builder: F)
  where
    F: Fn(&StepDef, &StepRegistry, &Services) -> Result<Arc<dyn Step>, StepError>
      + Send
      + Sync
      + 'static,
  {
    self.builders.insert(kind.to_string(), Arc::new(builder));
  }

  pub fn kinds(&self) -> Vec<&str> {
    let mut kinds: Vec<&str> = self.builders.keys().map(String::as_str).collect();
    kinds.sort_unstable();
    kinds
  }

  /// Build one step.
  pub fn build(&self, def: &StepDef, services: &Services) -> Result<Arc<dyn Step>, StepError> {
    let builder = self.builders.get(&def.kind).ok_or_else(|| {
      StepError::configuration(label(def), format!("unknown step type '{}'", def.kind))
    })?;
    debug!(kind = %def.kind, name = ?def.name, "building_step");
    builder(def, self, services)
  }

  /// Build steps in order, failing on the first bad definition.
  pub fn build_all(
    &self,
    defs: &[StepDef],
    services: &Services,
  ) -> Result<Vec<Arc<dyn Step>>, StepError> {
    defs.iter().map(|def| self.build(def, services)).collect()
  }

  /// Build a pipeline as a top-level chain.
  pub fn build_pipeline(
    &self,
    pipeline: &PipelineDef,
    services: &Services,
  ) -> Result<Chain, StepError> {
    let steps = self.build_all(&pipeline.steps, services)?;
    Ok(Chain::new(Some(pipeline.name.clone()), steps).with_notifier(services.notifier.clone()))
  }
}

fn label(def: &StepDef) -> String {
  def.name.clone().unwrap_or_else(|| def.kind.clone())
}

fn params<T: serde::de::DeserializeOwned>(def: &StepDef) -> Result<T, StepError> {
  def
    .params()
    .map_err(|e| StepError::configuration(label(def), e.to_string()))
}

fn build_code_execution(
  def: &StepDef,
  _registry: &StepRegistry,
  services: &Services,
) -> Result<Arc<dyn Step>, StepError> {
  let code: CodeExecutionDef = params(def)?;
  let step = CodeExecutionStep::new(
    def.name.clone(),
    code,
    LocalSandbox::new(services.policy.clone()),
    services.remote_sandbox(),
  )?
  .with_notifier(services.notifier.clone());
  Ok(Arc::new(step))
}

fn build_template(
  def: &StepDef,
  _registry: &StepRegistry,
  _services: &Services,
) -> Result<Arc<dyn Step>, StepError> {
  let template: TemplateDef = params(def)?;
  Ok(Arc::new(TemplateStep::new(def.name.clone(), template.output)))
}

fn build_completion(
  def: &StepDef,
  _registry: &StepRegistry,
  services: &Services,
) -> Result<Arc<dyn Step>, StepError> {
  let completion: CompletionDef = params(def)?;
  let service = services
    .completion
    .clone()
    .ok_or_else(|| StepError::configuration(label(def), "no completion service configured"))?;
  Ok(Arc::new(CompletionStep::new(def.name.clone(), completion, service)))
}

fn build_chain(
  def: &StepDef,
  registry: &StepRegistry,
  services: &Services,
) -> Result<Arc<dyn Step>, StepError> {
  let chain: ChainDef = params(def)?;
  let steps = registry.build_all(&chain.steps, services)?;
  Ok(Arc::new(
    Chain::new(def.name.clone(), steps)
      .with_failure_mode(chain.failure_mode)
      .with_notifier(services.notifier.clone()),
  ))
}

fn build_conditional(
  def: &StepDef,
  registry: &StepRegistry,
  services: &Services,
) -> Result<Arc<dyn Step>, StepError> {
  let conditional: ConditionalDef = params(def)?;
  let sandbox = services.remote_sandbox().ok_or_else(|| {
    StepError::configuration(label(def), "conditions require a session provider")
  })?;
  if conditional.branches.is_empty() {
    return Err(StepError::configuration(label(def), "at least one branch is required"));
  }

  let branches = conditional
    .branches
    .iter()
    .map(|branch| {
      Ok(Branch {
        condition: branch.condition.clone(),
        steps: registry.build_all(&branch.steps, services)?,
      })
    })
    .collect::<Result<Vec<_>, StepError>>()?;

  let mut step = ConditionalStep::new(def.name.clone(), branches, sandbox)
    .with_notifier(services.notifier.clone());
  if let Some(session_id) = conditional.session_id {
    step = step.with_session_id(session_id);
  }
  Ok(Arc::new(step))
}

fn build_loop(
  def: &StepDef,
  registry: &StepRegistry,
  services: &Services,
) -> Result<Arc<dyn Step>, StepError> {
  let loop_def: LoopDef = params(def)?;
  let source = match loop_def.mode {
    LoopMode::Map => LoopSource::Map(
      loop_def
        .source
        .clone()
        .ok_or_else(|| StepError::configuration(label(def), "map mode requires 'source'"))?,
    ),
    LoopMode::Repeat => LoopSource::Repeat(loop_def.loop_count.clone().ok_or_else(|| {
      StepError::configuration(label(def), "repeat mode requires 'loop_count'")
    })?),
  };
  if loop_def.body.is_empty() {
    return Err(StepError::configuration(label(def), "loop body must not be empty"));
  }

  let body = registry.build_all(&loop_def.body, services)?;
  let mut step = LoopStep::new(def.name.clone(), source, body)
    .with_failure_mode(loop_def.failure_mode)
    .with_max_iterations(loop_def.max_iterations as usize)
    .with_notifier(services.notifier.clone());
  if loop_def.execution_mode == ExecutionMode::Parallel {
    step = step.parallel(loop_def.concurrency as usize);
  }
  Ok(Arc::new(step))
}
