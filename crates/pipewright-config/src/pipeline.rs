use serde::{Deserialize, Serialize};

use crate::step::StepDef;

/// A pipeline file: a named, ordered list of steps executed as one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  pub steps: Vec<StepDef>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_pipeline() {
    let pipeline: PipelineDef = serde_json::from_value(json!({
      "name": "demo",
      "steps": [
        { "type": "template", "name": "greet", "output": "hi {{ who }}" },
        { "type": "code_execution", "name": "calc", "code": "function main(input) return 1 end" }
      ]
    }))
    .unwrap();

    assert_eq!(pipeline.name, "demo");
    assert_eq!(pipeline.steps.len(), 2);
    assert_eq!(pipeline.steps[0].kind, "template");
    assert_eq!(pipeline.steps[1].name.as_deref(), Some("calc"));
    assert!(pipeline.description.is_none());
  }
}
