//! Template resolution using minijinja expressions.
//!
//! Each `{{ expr }}` in a template is compiled as a minijinja expression and
//! evaluated against the context, so filters and attribute access work as they
//! do in full templates:
//!
//! ```json
//! { "greeting": "Hello {{ user.name | title }}!", "items": "{{ results }}" }
//! ```
//!
//! # Missing values
//! An expression that is undefined, or fails to evaluate, renders as its
//! original text (`{{ user.name }}`), never as an error. Block templates
//! (`{% ... %}`) that print an undefined value render as the whole original
//! template.
//!
//! # Complex values
//! Lists and maps substituted into text are serialized to JSON first. A
//! template consisting of exactly one expression can be resolved to the typed
//! value instead via [`TemplateResolver::render_value`].

use minijinja::{Environment, UndefinedBehavior, Value};
use tracing::{debug, warn};

use crate::error::TemplateError;

/// A piece of a parsed template.
#[derive(Debug, PartialEq)]
enum Segment<'a> {
  Text(&'a str),
  Expr { raw: &'a str, expr: &'a str },
}

/// Renders string and JSON configuration against a context snapshot.
#[derive(Clone)]
pub struct TemplateResolver {
  env: Environment<'static>,
  blocks: Environment<'static>,
}

impl Default for TemplateResolver {
  fn default() -> Self {
    Self::new()
  }
}

impl TemplateResolver {
  pub fn new() -> Self {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    let mut blocks = Environment::new();
    blocks.set_undefined_behavior(UndefinedBehavior::SemiStrict);
    Self { env, blocks }
  }

  /// Render a template to text.
  pub fn render_str(&self, template: &str, context: &serde_json::Value) -> String {
    if template.contains("{%") {
      return match self.render_block(template, context) {
        Ok(rendered) => rendered,
        Err(e) => {
          warn!(error = %e, "template_render_failed");
          template.to_string()
        }
      };
    }

    let segments = parse_segments(template);
    if !segments.iter().any(|s| matches!(s, Segment::Expr { .. })) {
      return template.to_string();
    }

    let ctx = Value::from_serialize(context);
    let mut rendered = String::with_capacity(template.len());
    for segment in segments {
      match segment {
        Segment::Text(text) => rendered.push_str(text),
        Segment::Expr { raw, expr } => match self.eval(expr, &ctx) {
          Ok(value) => rendered.push_str(&to_text(&value)),
          Err(e) => {
            debug!(error = %e, "template_placeholder");
            rendered.push_str(raw);
          }
        },
      }
    }
    rendered
  }

  /// Render a template to a JSON value.
  ///
  /// A template that is exactly one expression yields the referenced value
  /// with its type intact. Anything else is rendered to a string.
  pub fn render_value(&self, template: &str, context: &serde_json::Value) -> serde_json::Value {
    let trimmed = template.trim();
    let segments = parse_segments(trimmed);
    if let [Segment::Expr { raw, expr }] = segments.as_slice() {
      let ctx = Value::from_serialize(context);
      return match self.eval(expr, &ctx) {
        Ok(value) => value,
        Err(e) => {
          debug!(error = %e, "template_placeholder");
          serde_json::Value::String(raw.to_string())
        }
      };
    }

    serde_json::Value::String(self.render_str(template, context))
  }

  /// Render every string leaf of a JSON configuration value.
  ///
  /// Strings without template syntax are kept verbatim.
  pub fn render_json(
    &self,
    value: &serde_json::Value,
    context: &serde_json::Value,
  ) -> serde_json::Value {
    match value {
      serde_json::Value::String(s) if has_expressions(s) => self.render_value(s, context),
      serde_json::Value::Array(items) => serde_json::Value::Array(
        items
          .iter()
          .map(|item| self.render_json(item, context))
          .collect(),
      ),
      serde_json::Value::Object(map) => serde_json::Value::Object(
        map
          .iter()
          .map(|(k, v)| (k.clone(), self.render_json(v, context)))
          .collect(),
      ),
      other => other.clone(),
    }
  }

  /// Evaluate one expression against the context.
  fn eval(&self, expr: &str, ctx: &Value) -> Result<serde_json::Value, TemplateError> {
    let compiled = self
      .env
      .compile_expression(expr)
      .map_err(|e| TemplateError::Expression {
        expression: expr.to_string(),
        message: e.to_string(),
      })?;

    let value = compiled.eval(ctx).map_err(|e| TemplateError::Expression {
      expression: expr.to_string(),
      message: e.to_string(),
    })?;

    if value.is_undefined() {
      return Err(TemplateError::Undefined {
        expression: expr.to_string(),
      });
    }

    serde_json::to_value(&value).map_err(|e| TemplateError::Expression {
      expression: expr.to_string(),
      message: e.to_string(),
    })
  }

  /// Full minijinja render for templates using block syntax. Printing an
  /// undefined value is an error here.
  fn render_block(
    &self,
    template: &str,
    context: &serde_json::Value,
  ) -> Result<String, TemplateError> {
    self
      .blocks
      .render_str(template, Value::from_serialize(context))
      .map_err(|e| TemplateError::Render {
        message: e.to_string(),
      })
  }
}

/// Whether a string contains template syntax.
pub fn has_expressions(s: &str) -> bool {
  s.contains("{{") || s.contains("{%")
}

/// Text form of a resolved value. Strings are inserted as-is, everything else
/// as JSON.
fn to_text(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn parse_segments(template: &str) -> Vec<Segment<'_>> {
  let mut segments = Vec::new();
  let mut rest = template;

  while let Some(start) = rest.find("{{") {
    let Some(len) = rest[start + 2..].find("}}") else {
      break;
    };
    if start > 0 {
      segments.push(Segment::Text(&rest[..start]));
    }
    let end = start + 2 + len + 2;
    let expr = rest[start + 2..start + 2 + len]
      .trim()
      .trim_start_matches('-')
      .trim_end_matches('-')
      .trim();
    segments.push(Segment::Expr {
      raw: &rest[start..end],
      expr,
    });
    rest = &rest[end..];
  }

  if !rest.is_empty() {
    segments.push(Segment::Text(rest));
  }
  segments
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_render_simple_variable() {
    let resolver = TemplateResolver::new();
    let ctx = json!({ "email": "test@example.com" });

    assert_eq!(
      resolver.render_str("to: {{ email }}", &ctx),
      "to: test@example.com"
    );
  }

  #[test]
  fn test_minijinja_filters() {
    let resolver = TemplateResolver::new();
    let ctx = json!({ "name": "john doe" });

    assert_eq!(
      resolver.render_str("Hello {{ name | title }}!", &ctx),
      "Hello John Doe!"
    );
    assert_eq!(resolver.render_str("{{ name | upper }}", &ctx), "JOHN DOE");
  }

  #[test]
  fn test_attribute_access() {
    let resolver = TemplateResolver::new();
    let ctx = json!({ "fetch_user": { "email": "a@b.c" } });

    assert_eq!(resolver.render_str("{{ fetch_user.email }}", &ctx), "a@b.c");
  }

  #[test]
  fn test_missing_variable_renders_placeholder() {
    let resolver = TemplateResolver::new();
    let ctx = json!({ "name": "Alice" });

    assert_eq!(
      resolver.render_str("Hi {{ name }}, score {{ score }}", &ctx),
      "Hi Alice, score {{ score }}"
    );
    assert_eq!(
      resolver.render_str("{{ user.email }}", &ctx),
      "{{ user.email }}"
    );
  }

  #[test]
  fn test_invalid_expression_renders_placeholder() {
    let resolver = TemplateResolver::new();
    let ctx = json!({});

    assert_eq!(resolver.render_str("x {{ 1 + }} y", &ctx), "x {{ 1 + }} y");
  }

  #[test]
  fn test_complex_values_serialized_as_json() {
    let resolver = TemplateResolver::new();
    let ctx = json!({ "items": [1, 2, 3], "config": { "k": "v" } });

    assert_eq!(resolver.render_str("items={{ items }}", &ctx), "items=[1,2,3]");
    assert_eq!(
      resolver.render_str("config={{ config }}", &ctx),
      r#"config={"k":"v"}"#
    );
  }

  #[test]
  fn test_mixed_template_and_literal() {
    let resolver = TemplateResolver::new();
    let ctx = json!({ "name": "Alice", "count": 5 });

    assert_eq!(
      resolver.render_str("Hello {{ name }}, you have {{ count }} messages", &ctx),
      "Hello Alice, you have 5 messages"
    );
  }

  #[test]
  fn test_render_value_keeps_type() {
    let resolver = TemplateResolver::new();
    let ctx = json!({ "items": ["a", "b"], "n": 3, "flag": true });

    assert_eq!(resolver.render_value("{{ items }}", &ctx), json!(["a", "b"]));
    assert_eq!(resolver.render_value(" {{ n }} ", &ctx), json!(3));
    assert_eq!(resolver.render_value("{{ flag }}", &ctx), json!(true));
    assert_eq!(resolver.render_value("{{ items | length }}", &ctx), json!(2));
  }

  #[test]
  fn test_render_value_mixed_template_stays_text() {
    let resolver = TemplateResolver::new();
    let ctx = json!({ "n": 2, "items": [1] });

    assert_eq!(resolver.render_value("{{ n }}0", &ctx), json!("20"));
    assert_eq!(resolver.render_value("[{{ n }}]", &ctx), json!("[2]"));
    assert_eq!(resolver.render_value("{{ items }} ", &ctx), json!([1]));
    assert_eq!(resolver.render_value("[1, 2, 3]", &ctx), json!("[1, 2, 3]"));
    assert_eq!(resolver.render_value("plain text", &ctx), json!("plain text"));
  }

  #[test]
  fn test_render_value_missing_is_placeholder() {
    let resolver = TemplateResolver::new();

    assert_eq!(
      resolver.render_value("{{ missing }}", &json!({})),
      json!("{{ missing }}")
    );
  }

  #[test]
  fn test_render_json_recurses() {
    let resolver = TemplateResolver::new();
    let ctx = json!({ "name": "Bob", "items": [1, 2] });
    let config = json!({
      "greeting": "hi {{ name }}",
      "nested": { "list": ["{{ items }}", "static"] },
      "number": 7
    });

    assert_eq!(
      resolver.render_json(&config, &ctx),
      json!({
        "greeting": "hi Bob",
        "nested": { "list": [[1, 2], "static"] },
        "number": 7
      })
    );
  }

  #[test]
  fn test_block_syntax_falls_back_to_full_render() {
    let resolver = TemplateResolver::new();
    let ctx = json!({ "items": ["a", "b"] });

    assert_eq!(
      resolver.render_str("{% for i in items %}{{ i }};{% endfor %}", &ctx),
      "a;b;"
    );
  }

  #[test]
  fn test_block_with_missing_value_renders_original() {
    let resolver = TemplateResolver::new();
    let template = "{% if true %}v={{ missing }}{% endif %}";

    assert_eq!(resolver.render_str(template, &json!({})), template);
    assert_eq!(resolver.render_value(template, &json!({})), json!(template));
  }

  #[test]
  fn test_block_undefined_condition_is_false() {
    let resolver = TemplateResolver::new();

    assert_eq!(
      resolver.render_str("{% if flag %}on{% else %}off{% endif %}", &json!({})),
      "off"
    );
  }

  #[test]
  fn test_unclosed_expression_is_literal() {
    let resolver = TemplateResolver::new();

    assert_eq!(resolver.render_str("a {{ b", &json!({ "b": 1 })), "a {{ b");
  }

  #[test]
  fn test_parse_segments() {
    assert_eq!(
      parse_segments("a{{ x }}b"),
      vec![
        Segment::Text("a"),
        Segment::Expr {
          raw: "{{ x }}",
          expr: "x"
        },
        Segment::Text("b"),
      ]
    );
  }
}
