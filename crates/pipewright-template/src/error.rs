/// Errors raised while rendering a template.
///
/// The public rendering entry points recover from these by falling back to
/// placeholders; they surface only in logs.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
  /// The expression inside `{{ ... }}` failed to compile or evaluate.
  #[error("failed to evaluate expression '{expression}': {message}")]
  Expression { expression: String, message: String },

  /// The expression evaluated to an undefined value.
  #[error("undefined value in expression '{expression}'")]
  Undefined { expression: String },

  /// A template with block syntax failed to render.
  #[error("failed to render template: {message}")]
  Render { message: String },
}
