//! Conversion of Lua values into transport-safe JSON.
//!
//! Tables are walked recursively; values with no JSON form (functions,
//! userdata, threads, non-finite numbers) are coerced to strings.

use mlua::Value;

const MAX_DEPTH: usize = 64;

/// Convert a Lua value to JSON, coercing anything unrepresentable.
pub(crate) fn lua_to_json(value: &Value) -> serde_json::Value {
  convert(value, 0)
}

fn convert(value: &Value, depth: usize) -> serde_json::Value {
  match value {
    Value::Nil => serde_json::Value::Null,
    Value::Boolean(b) => serde_json::Value::Bool(*b),
    Value::Integer(i) => serde_json::Value::Number((*i).into()),
    Value::Number(n) => serde_json::Number::from_f64(*n)
      .map(serde_json::Value::Number)
      .unwrap_or_else(|| serde_json::Value::String(display_number(*n))),
    Value::String(s) => serde_json::Value::String(s.to_string_lossy().to_string()),
    Value::LightUserData(ud) if ud.0.is_null() => serde_json::Value::Null,
    Value::Table(table) => {
      if depth >= MAX_DEPTH {
        return serde_json::Value::String("<max depth exceeded>".to_string());
      }
      convert_table(table, depth)
    }
    other => serde_json::Value::String(opaque(other)),
  }
}

fn convert_table(table: &mlua::Table, depth: usize) -> serde_json::Value {
  let entries: Vec<(Value, Value)> = table
    .clone()
    .pairs::<Value, Value>()
    .filter_map(Result::ok)
    .collect();

  let len = table.raw_len();
  if len > 0 && entries.len() == len {
    let mut items: Vec<(i64, serde_json::Value)> = entries
      .iter()
      .filter_map(|(k, v)| match k {
        Value::Integer(i) => Some((*i, convert(v, depth + 1))),
        _ => None,
      })
      .collect();
    if items.len() == len {
      items.sort_by_key(|(i, _)| *i);
      return serde_json::Value::Array(items.into_iter().map(|(_, v)| v).collect());
    }
  }

  let map = entries
    .iter()
    .map(|(k, v)| (key_to_string(k), convert(v, depth + 1)))
    .collect();
  serde_json::Value::Object(map)
}

fn key_to_string(key: &Value) -> String {
  match key {
    Value::String(s) => s.to_string_lossy().to_string(),
    Value::Integer(i) => i.to_string(),
    Value::Number(n) => display_number(*n),
    Value::Boolean(b) => b.to_string(),
    other => opaque(other),
  }
}

/// Text form of a value, as `print` shows it.
pub(crate) fn display_value(value: &Value) -> String {
  match value {
    Value::Nil => "nil".to_string(),
    Value::Boolean(b) => b.to_string(),
    Value::Integer(i) => i.to_string(),
    Value::Number(n) => display_number(*n),
    Value::String(s) => s.to_string_lossy().to_string(),
    Value::LightUserData(ud) if ud.0.is_null() => "null".to_string(),
    other => opaque(other),
  }
}

fn display_number(n: f64) -> String {
  if n.is_nan() {
    "nan".to_string()
  } else if n.is_infinite() {
    if n > 0.0 { "inf" } else { "-inf" }.to_string()
  } else if n.fract() == 0.0 && n.abs() < 1e15 {
    format!("{:.1}", n)
  } else {
    n.to_string()
  }
}

fn opaque(value: &Value) -> String {
  format!("{}: {:p}", value.type_name(), value.to_pointer())
}
