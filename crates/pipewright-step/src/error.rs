//! Step error taxonomy.

use std::time::Duration;

use pipewright_sandbox::SandboxError;

use crate::result::StepResult;

/// Everything that can go wrong inside a step.
///
/// Never raised past a step boundary: converted into an error
/// [`StepResult`] with `metadata.error_kind` set to [`StepError::kind`].
#[derive(Debug, thiserror::Error)]
pub enum StepError {
  /// A bad or missing field, detected before execution.
  #[error("configuration error in step '{step}': {message}")]
  Configuration { step: String, message: String },

  /// Malformed input shape.
  #[error("invalid input: {message}")]
  Validation { message: String },

  /// A remote session could not be created or attached.
  #[error("failed to initialize sandbox session '{session_id}': {message}")]
  SandboxInit { session_id: String, message: String },

  /// User code failed, a command exited non-zero, or a construct was
  /// disallowed. Scoped to one call.
  #[error("{message}")]
  Execution { message: String },

  /// Execution hit its time ceiling.
  #[error("execution timed out after {}ms", .timeout.as_millis())]
  Timeout { timeout: Duration },

  /// Exported variables could not be recovered.
  #[error("failed to decode exported variables: {message}")]
  ExportDecode { message: String },
}

impl StepError {
  pub fn configuration(step: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Configuration {
      step: step.into(),
      message: message.into(),
    }
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation {
      message: message.into(),
    }
  }

  pub fn execution(message: impl Into<String>) -> Self {
    Self::Execution {
      message: message.into(),
    }
  }

  /// Stable tag recorded as `metadata.error_kind`.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Configuration { .. } => "configuration",
      Self::Validation { .. } => "validation",
      Self::SandboxInit { .. } => "sandbox_init",
      Self::Execution { .. } => "execution",
      Self::Timeout { .. } => "timeout",
      Self::ExportDecode { .. } => "export_decode",
    }
  }

  /// Whether retrying the same step or session cannot succeed.
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Configuration { .. } | Self::SandboxInit { .. })
  }
}

impl From<SandboxError> for StepError {
  fn from(err: SandboxError) -> Self {
    match err {
      SandboxError::SessionInit {
        session_id,
        message,
      } => Self::SandboxInit {
        session_id,
        message,
      },
      SandboxError::Timeout { timeout } => Self::Timeout { timeout },
      other => Self::Execution {
        message: other.to_string(),
      },
    }
  }
}

impl From<StepError> for StepResult {
  fn from(err: StepError) -> Self {
    StepResult::error(err.to_string()).with_metadata("error_kind", err.kind())
  }
}
