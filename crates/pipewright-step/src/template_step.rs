//! A pure step that renders a templated JSON value.

use pipewright_template::TemplateResolver;
use tracing::debug;

use crate::result::StepResult;
use crate::step::{Step, require_object};

/// Renders `output` against its input; no side effects.
pub struct TemplateStep {
  name: Option<String>,
  output: serde_json::Value,
  resolver: TemplateResolver,
}

impl TemplateStep {
  pub fn new(name: Option<String>, output: serde_json::Value) -> Self {
    Self {
      name,
      output,
      resolver: TemplateResolver::new(),
    }
  }
}

impl Step for TemplateStep {
  fn kind(&self) -> &'static str {
    "template"
  }

  fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  fn execute(&self, input: &serde_json::Value) -> StepResult {
    if let Err(e) = require_object(input) {
      return e.into();
    }

    let rendered = self.resolver.render_json(&self.output, input);
    debug!(step = ?self.name, "template_rendered");
    StepResult::success(rendered)
  }
}
