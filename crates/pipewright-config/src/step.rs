use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::enums::{
  ExecutionMode, ExecutionVariant, FailureMode, LoopMode, ResponseFormat, SandboxBackend,
};
use crate::input::TemplateValue;

/// A step definition as written in a pipeline file.
///
/// The `type` tag selects the builder in the step registry; every other field
/// is kind-specific and decoded by that builder via [`StepDef::params`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  #[serde(rename = "type")]
  pub kind: String,
  /// Name under which the step's output is stored in the context.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(flatten)]
  pub params: serde_json::Map<String, serde_json::Value>,
}

impl StepDef {
  /// Create a definition from a kind tag and its fields.
  pub fn new(kind: impl Into<String>, name: Option<&str>, params: serde_json::Value) -> Self {
    let params = match params {
      serde_json::Value::Object(map) => map,
      _ => serde_json::Map::new(),
    };
    Self {
      kind: kind.into(),
      name: name.map(str::to_string),
      params,
    }
  }

  /// Decode the kind-specific fields.
  pub fn params<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::Value::Object(self.params.clone()))
  }
}

/// `type: "code_execution"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionDef {
  pub code: String,
  #[serde(default)]
  pub backend: SandboxBackend,
  #[serde(default)]
  pub variant: ExecutionVariant,
  /// Remote session id (template). Defaults to a per-step id.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub session_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
  /// Emit incremental output chunks when streamed.
  #[serde(default)]
  pub stream: bool,
}

/// `type: "chain"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDef {
  pub steps: Vec<StepDef>,
  #[serde(default)]
  pub failure_mode: FailureMode,
}

/// `type: "conditional"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalDef {
  pub branches: Vec<BranchDef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchDef {
  pub condition: BranchCondition,
  #[serde(default)]
  pub steps: Vec<StepDef>,
}

/// A branch guard: a boolean expression, or the literal `else`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BranchCondition {
  Expression(String),
  Else,
}

impl From<String> for BranchCondition {
  fn from(value: String) -> Self {
    if value.trim() == "else" {
      Self::Else
    } else {
      Self::Expression(value)
    }
  }
}

impl From<BranchCondition> for String {
  fn from(value: BranchCondition) -> Self {
    match value {
      BranchCondition::Expression(expr) => expr,
      BranchCondition::Else => "else".to_string(),
    }
  }
}

/// `type: "loop"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDef {
  #[serde(default)]
  pub mode: LoopMode,
  /// Template rendering to a list (map mode).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,
  /// Literal or template rendering to a positive integer (repeat mode).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub loop_count: Option<LoopCount>,
  #[serde(default)]
  pub execution_mode: ExecutionMode,
  #[serde(default = "default_concurrency")]
  pub concurrency: u32,
  #[serde(default)]
  pub failure_mode: FailureMode,
  /// Upper bound on the number of iterations a single run may produce.
  #[serde(default = "default_max_iterations")]
  pub max_iterations: u32,
  pub body: Vec<StepDef>,
}

fn default_concurrency() -> u32 {
  4
}

fn default_max_iterations() -> u32 {
  10_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopCount {
  Literal(i64),
  Template(String),
}

/// `type: "template"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDef {
  pub output: TemplateValue,
}

/// `type: "completion"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionDef {
  pub messages: Vec<MessageDef>,
  #[serde(default)]
  pub response_format: ResponseFormat,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDef {
  pub role: String,
  /// Template rendered against the step input.
  pub content: String,
}
