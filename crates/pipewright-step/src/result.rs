//! The result envelope every step returns.

use serde::{Deserialize, Serialize};

/// Metadata key holding variables a step exported.
pub const EXPORTED_VARIABLES: &str = "exported_variables";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
  Success,
  Error,
  InProgress,
}

/// `{status, data, metadata}`.
///
/// A streamed call yields any number of `in_progress` envelopes followed by
/// exactly one `success` or `error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
  pub status: StepStatus,
  pub data: serde_json::Value,
  #[serde(default)]
  pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl StepResult {
  pub fn success(data: impl Into<serde_json::Value>) -> Self {
    Self::with_status(StepStatus::Success, data.into())
  }

  pub fn error(data: impl Into<serde_json::Value>) -> Self {
    Self::with_status(StepStatus::Error, data.into())
  }

  pub fn in_progress(data: impl Into<serde_json::Value>) -> Self {
    Self::with_status(StepStatus::InProgress, data.into())
  }

  fn with_status(status: StepStatus, data: serde_json::Value) -> Self {
    Self {
      status,
      data,
      metadata: serde_json::Map::new(),
    }
  }

  /// Add a metadata entry.
  pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
    self.metadata.insert(key.to_string(), value.into());
    self
  }

  pub fn is_success(&self) -> bool {
    self.status == StepStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == StepStatus::Error
  }

  /// Whether this is the last envelope of a call.
  pub fn is_terminal(&self) -> bool {
    self.status != StepStatus::InProgress
  }

  /// Variables the step exported, empty when none.
  pub fn exported_variables(&self) -> serde_json::Map<String, serde_json::Value> {
    self
      .metadata
      .get(EXPORTED_VARIABLES)
      .and_then(|v| v.as_object())
      .cloned()
      .unwrap_or_default()
  }

  /// Attach exported variables. Empty maps are not recorded.
  pub fn with_exported_variables(
    mut self,
    exports: serde_json::Map<String, serde_json::Value>,
  ) -> Self {
    if !exports.is_empty() {
      self
        .metadata
        .insert(EXPORTED_VARIABLES.to_string(), serde_json::Value::Object(exports));
    }
    self
  }

  /// The envelope as a JSON value.
  pub fn to_value(&self) -> serde_json::Value {
    serde_json::json!({
      "status": self.status,
      "data": self.data,
      "metadata": self.metadata,
    })
  }
}
