//! Variable export protocol for remote Python sessions.
//!
//! Before user code runs, the caller's context is injected as ordinary Python
//! globals by a setup snippet of literal assignments. After it runs, the
//! export snippet prints every JSON-serializable global between two marker
//! lines:
//!
//! ```text
//! __PIPEWRIGHT_EXPORT_BEGIN__
//! {"x": 42, "y": "hello"}
//! __PIPEWRIGHT_EXPORT_END__
//! ```
//!
//! Any other stdout is ordinary step output, never export payload.

use crate::error::ExportDecodeError;

pub const EXPORT_BEGIN_MARKER: &str = "__PIPEWRIGHT_EXPORT_BEGIN__";
pub const EXPORT_END_MARKER: &str = "__PIPEWRIGHT_EXPORT_END__";

/// First line of every setup snippet.
pub const SETUP_HEADER: &str = "# pipewright: context setup";
/// First line of every condition snippet.
pub const CONDITION_HEADER: &str = "# pipewright: condition";

/// Python snippet that prints the exportable globals between the markers.
///
/// Skips dunder names, modules, functions, classes, and anything `json`
/// cannot serialize, non-finite floats included. Cleans up its own
/// temporaries.
pub const EXPORT_SNIPPET: &str = r#"# pipewright: export globals
import json as __pw_json
import types as __pw_types
__pw_exports = {}
for __pw_name, __pw_value in list(globals().items()):
    if __pw_name.startswith("__"):
        continue
    if isinstance(__pw_value, (__pw_types.ModuleType, __pw_types.FunctionType, __pw_types.BuiltinFunctionType, type)):
        continue
    try:
        __pw_json.dumps(__pw_value, allow_nan=False)
    except (TypeError, ValueError, OverflowError, RecursionError):
        continue
    __pw_exports[__pw_name] = __pw_value
print("__PIPEWRIGHT_EXPORT_BEGIN__")
print(__pw_json.dumps(__pw_exports, allow_nan=False))
print("__PIPEWRIGHT_EXPORT_END__")
for __pw_key in ("__pw_json", "__pw_types", "__pw_exports", "__pw_name", "__pw_value"):
    globals().pop(__pw_key, None)
globals().pop("__pw_key", None)
"#;

const PYTHON_KEYWORDS: &[&str] = &[
  "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
  "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in",
  "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with",
  "yield",
];

/// Build the setup snippet that assigns each context value to a global.
///
/// Each name in `reset` is removed from the session first and never assigned
/// from the context, so only code run afterwards can bind it. Keys that are
/// not plain identifiers are skipped. Returns `None` when there is nothing to
/// do.
pub fn setup_snippet(
  context: &serde_json::Map<String, serde_json::Value>,
  reset: &[&str],
) -> Option<String> {
  let resets = reset
    .iter()
    .filter(|name| is_assignable(name))
    .map(|name| format!("globals().pop({}, None)", python_literal(&json_string(name))));
  let assignments = context
    .iter()
    .filter(|(name, _)| is_assignable(name) && !reset.contains(&name.as_str()))
    .map(|(name, value)| format!("{} = {}", name, python_literal(value)));
  let lines: Vec<String> = resets.chain(assignments).collect();

  if lines.is_empty() {
    return None;
  }

  let mut snippet = String::from(SETUP_HEADER);
  for line in lines {
    snippet.push('\n');
    snippet.push_str(&line);
  }
  snippet.push('\n');
  Some(snippet)
}

/// Python statement printing `bool(<expression>)`.
///
/// The expression is evaluated in a fresh namespace holding only `context`
/// and the builtins. Session globals are neither visible to it nor changed
/// by it, so a name missing from `context` raises `NameError`.
pub fn condition_snippet(
  expression: &str,
  context: &serde_json::Map<String, serde_json::Value>,
) -> String {
  format!(
    "{}\nprint(bool(eval({}, dict({}, __builtins__=__builtins__))))\n",
    CONDITION_HEADER,
    python_literal(&json_string(expression)),
    python_literal(&serde_json::Value::Object(context.clone())),
  )
}

fn json_string(s: &str) -> serde_json::Value {
  serde_json::Value::String(s.to_string())
}

/// Python source literal for a JSON value.
///
/// Multi-line strings become triple-quoted literals.
pub fn python_literal(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::Null => "None".to_string(),
    serde_json::Value::Bool(true) => "True".to_string(),
    serde_json::Value::Bool(false) => "False".to_string(),
    serde_json::Value::Number(n) => n.to_string(),
    serde_json::Value::String(s) if s.contains('\n') => {
      let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
      format!("\"\"\"{}\"\"\"", escaped)
    }
    serde_json::Value::String(s) => serde_json::Value::String(s.clone()).to_string(),
    serde_json::Value::Array(items) => {
      let items: Vec<String> = items.iter().map(python_literal).collect();
      format!("[{}]", items.join(", "))
    }
    serde_json::Value::Object(map) => {
      let entries: Vec<String> = map
        .iter()
        .map(|(k, v)| {
          format!(
            "{}: {}",
            serde_json::Value::String(k.clone()),
            python_literal(v)
          )
        })
        .collect();
      format!("{{{}}}", entries.join(", "))
    }
  }
}

fn is_assignable(name: &str) -> bool {
  let mut chars = name.chars();
  let Some(first) = chars.next() else {
    return false;
  };
  (first.is_ascii_alphabetic() || first == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    && !name.starts_with("__")
    && !PYTHON_KEYWORDS.contains(&name)
}

/// Recover the exported variables from combined stdout.
///
/// Uses the last marker pair when several are present.
pub fn extract_exports(
  stdout: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, ExportDecodeError> {
  let lines: Vec<&str> = stdout.lines().collect();
  let begin = lines
    .iter()
    .rposition(|l| l.trim() == EXPORT_BEGIN_MARKER)
    .ok_or(ExportDecodeError::MissingMarkers)?;
  let end = lines[begin + 1..]
    .iter()
    .position(|l| l.trim() == EXPORT_END_MARKER)
    .map(|offset| begin + 1 + offset)
    .ok_or(ExportDecodeError::MissingMarkers)?;

  let payload = lines[begin + 1..end].join("\n");
  let value: serde_json::Value =
    serde_json::from_str(payload.trim()).map_err(|e| ExportDecodeError::InvalidJson {
      message: e.to_string(),
    })?;

  match value {
    serde_json::Value::Object(map) => Ok(map),
    _ => Err(ExportDecodeError::NotAnObject),
  }
}

/// Remove marker blocks from stdout, leaving the ordinary output.
pub fn strip_export_block(stdout: &str) -> String {
  let mut kept = String::with_capacity(stdout.len());
  let mut inside = false;
  for line in stdout.split_inclusive('\n') {
    let trimmed = line.trim();
    if trimmed == EXPORT_BEGIN_MARKER {
      inside = true;
      continue;
    }
    if inside {
      if trimmed == EXPORT_END_MARKER {
        inside = false;
      }
      continue;
    }
    kept.push_str(line);
  }
  kept
}
