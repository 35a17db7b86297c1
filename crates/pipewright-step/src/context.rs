//! Shared state threaded through a sequence of steps.

use serde::{Deserialize, Serialize};

use crate::result::{StepResult, StepStatus};

/// Key that, when truthy, halts the remaining steps of a sequence.
pub const EARLY_RETURN_KEY: &str = "early_return";

/// One executed step, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
  pub step: String,
  pub kind: String,
  pub status: StepStatus,
  pub data: serde_json::Value,
}

/// Named step outputs and exported variables for one invocation.
///
/// Last write wins. Exported variables are merged only through
/// [`Context::merge_exports`], called by the composition layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
  values: serde_json::Map<String, serde_json::Value>,
  history: Vec<HistoryEntry>,
}

impl Context {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
    self.values.get(key)
  }

  pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
    self.values.insert(key.into(), value);
  }

  pub fn values(&self) -> &serde_json::Map<String, serde_json::Value> {
    &self.values
  }

  pub fn history(&self) -> &[HistoryEntry] {
    &self.history
  }

  /// Store a named step's output and append it to the history.
  pub fn record(&mut self, name: &str, kind: &str, result: &StepResult) {
    self.values.insert(name.to_string(), result.data.clone());
    self.push_history(name, kind, result);
  }

  /// Append to the history without storing an output.
  pub fn push_history(&mut self, label: &str, kind: &str, result: &StepResult) {
    self.history.push(HistoryEntry {
      step: label.to_string(),
      kind: kind.to_string(),
      status: result.status,
      data: result.data.clone(),
    });
  }

  /// Flat-merge exported variables.
  ///
  /// Each variable is also stored as `<name>_str` holding its text form,
  /// unless the name already ends in `_str`.
  pub fn merge_exports(&mut self, exports: &serde_json::Map<String, serde_json::Value>) {
    for (name, value) in exports {
      self.values.insert(name.clone(), value.clone());
      if !name.ends_with("_str") {
        let text = match value {
          serde_json::Value::String(s) => s.clone(),
          other => other.to_string(),
        };
        self
          .values
          .insert(format!("{}_str", name), serde_json::Value::String(text));
      }
    }
  }

  /// The input a step receives: `input` overlaid with the context.
  ///
  /// Context entries win over input keys of the same name.
  pub fn step_input(
    &self,
    input: &serde_json::Map<String, serde_json::Value>,
  ) -> serde_json::Value {
    let mut merged = input.clone();
    merged.extend(self.values.clone());
    serde_json::Value::Object(merged)
  }

  /// Whether a step asked the sequence to stop.
  pub fn early_return(&self) -> bool {
    self.values.get(EARLY_RETURN_KEY).is_some_and(is_truthy)
  }

  /// History as a JSON array.
  pub fn history_value(&self) -> serde_json::Value {
    serde_json::to_value(&self.history).unwrap_or_default()
  }
}

fn is_truthy(value: &serde_json::Value) -> bool {
  match value {
    serde_json::Value::Null => false,
    serde_json::Value::Bool(b) => *b,
    serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
    serde_json::Value::String(s) => !s.is_empty(),
    serde_json::Value::Array(items) => !items.is_empty(),
    serde_json::Value::Object(map) => !map.is_empty(),
  }
}
