//! In-process restricted Lua execution.
//!
//! Every call gets a fresh interpreter:
//! 1. The source is scanned; findings abort before an interpreter exists.
//! 2. Only the safe standard libraries are opened, then every global outside
//!    the policy's allow-list is removed.
//! 3. `print` writes to a per-call buffer and `require` resolves only
//!    allow-listed modules.
//! 4. An instruction hook enforces the policy timeout. Once the deadline
//!    passes the hook fails on every tick, and `pcall`/`xpcall` re-raise, so
//!    a protected call cannot swallow the timeout.

mod convert;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mlua::{
  HookTriggers, Lua, LuaOptions, LuaSerdeExt, MultiValue, StdLib, Table, Value, Variadic, VmState,
};
use pipewright_config::ExecutionVariant;
use tracing::{debug, instrument, warn};

use crate::error::SandboxError;
use crate::policy::CapabilityPolicy;
use crate::scan::scan;

use convert::{display_value, lua_to_json};

const MODULES_KEY: &str = "pipewright.modules";
const TIMEOUT_MARKER: &str = "pipewright: execution deadline exceeded";
const HOOK_INTERVAL: u32 = 1_000;

/// Output of a local execution.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalOutput {
  /// Return value or captured stdout, per execution variant.
  pub value: serde_json::Value,
  /// Everything printed during the run.
  pub stdout: String,
}

/// Restricted in-process interpreter.
#[derive(Debug, Clone, Default)]
pub struct LocalSandbox {
  policy: CapabilityPolicy,
}

impl LocalSandbox {
  pub fn new(policy: CapabilityPolicy) -> Self {
    Self { policy }
  }

  pub fn policy(&self) -> &CapabilityPolicy {
    &self.policy
  }

  /// Run `source` against `input`.
  ///
  /// Blocking; callers on an async runtime should offload this to a worker
  /// thread. `timeout` overrides the policy timeout when given.
  #[instrument(name = "local_sandbox_execute", skip(self, source, input))]
  pub fn execute(
    &self,
    source: &str,
    input: &serde_json::Value,
    variant: ExecutionVariant,
    timeout: Option<Duration>,
  ) -> Result<LocalOutput, SandboxError> {
    let findings = scan(source, &self.policy);
    if !findings.is_empty() {
      warn!(findings = findings.len(), "security_scan_rejected");
      return Err(SandboxError::SecurityScan { findings });
    }

    let timeout = timeout.unwrap_or(self.policy.timeout);
    let stdout = Arc::new(Mutex::new(String::new()));
    let lua = self.create_interpreter(stdout.clone(), timeout)?;

    let value = run(&lua, source, input, variant, &self.policy.entry_point)
      .map_err(|e| map_lua_error(e, timeout))?;

    let stdout = stdout.lock().map(|s| s.clone()).unwrap_or_default();
    debug!(stdout_len = stdout.len(), "local_sandbox_completed");

    let value = match variant {
      ExecutionVariant::ReturnValue => value,
      ExecutionVariant::Stdout => serde_json::Value::String(stdout.clone()),
    };
    Ok(LocalOutput { value, stdout })
  }

  /// Build an interpreter restricted to the policy.
  fn create_interpreter(
    &self,
    stdout: Arc<Mutex<String>>,
    timeout: Duration,
  ) -> Result<Lua, SandboxError> {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8;
    let lua = Lua::new_with(libs, LuaOptions::new()).map_err(setup_error)?;

    if let Some(limit) = self.policy.memory_limit {
      lua.set_memory_limit(limit).map_err(setup_error)?;
    }

    self.install_modules(&lua).map_err(setup_error)?;
    self.strip_globals(&lua).map_err(setup_error)?;
    self.install_builtins(&lua, stdout).map_err(setup_error)?;

    let expired = Arc::new(AtomicBool::new(false));
    guard_protected_calls(&lua, expired.clone()).map_err(setup_error)?;

    let deadline = Instant::now() + timeout;
    lua.set_hook(
      HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
      move |_lua, _debug| {
        if expired.load(Ordering::Relaxed) || Instant::now() >= deadline {
          expired.store(true, Ordering::Relaxed);
          Err(mlua::Error::runtime(TIMEOUT_MARKER))
        } else {
          Ok(VmState::Continue)
        }
      },
    );

    Ok(lua)
  }

  /// Stash allow-listed modules in the registry for `require`.
  fn install_modules(&self, lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let modules = lua.create_table()?;

    for name in ["string", "table", "math", "utf8"] {
      if self.policy.allows_module(name) {
        let module: Value = globals.get(name)?;
        modules.set(name, module)?;
      }
    }
    if self.policy.allows_module("json") {
      modules.set("json", json_module(lua)?)?;
    }

    lua.set_named_registry_value(MODULES_KEY, modules)
  }

  /// Remove every global not on the allow-list.
  fn strip_globals(&self, lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let denied: Vec<String> = globals
      .clone()
      .pairs::<Value, Value>()
      .filter_map(Result::ok)
      .filter_map(|(key, _)| match key {
        Value::String(s) => Some(s.to_string_lossy().to_string()),
        _ => None,
      })
      .filter(|name| !self.policy.allows_global(name))
      .collect();

    for name in denied {
      globals.set(name, Value::Nil)?;
    }
    Ok(())
  }

  /// Install the capturing `print` and the allow-list `require`.
  fn install_builtins(&self, lua: &Lua, stdout: Arc<Mutex<String>>) -> mlua::Result<()> {
    let globals = lua.globals();

    if self.policy.allows_global("print") {
      let print = lua.create_function(move |_, args: Variadic<Value>| {
        let line = args.iter().map(display_value).collect::<Vec<_>>().join("\t");
        let mut out = stdout
          .lock()
          .map_err(|_| mlua::Error::runtime("stdout buffer poisoned"))?;
        out.push_str(&line);
        out.push('\n');
        Ok(())
      })?;
      globals.set("print", print)?;
    }

    if self.policy.allows_global("require") {
      let allowed = self.policy.allowed_modules.clone();
      let require = lua.create_function(move |lua, name: String| {
        if !allowed.contains(&name) {
          return Err(mlua::Error::runtime(format!(
            "module '{}' is not allowed in the sandbox",
            name
          )));
        }
        let modules: Table = lua.named_registry_value(MODULES_KEY)?;
        let module: Value = modules.get(name.as_str())?;
        if module.is_nil() {
          return Err(mlua::Error::runtime(format!("module '{}' not found", name)));
        }
        Ok(module)
      })?;
      globals.set("require", require)?;
    }

    Ok(())
  }
}

/// Wrap `pcall` and `xpcall` so they re-raise once the deadline has expired.
fn guard_protected_calls(lua: &Lua, expired: Arc<AtomicBool>) -> mlua::Result<()> {
  let globals = lua.globals();

  for name in ["pcall", "xpcall"] {
    let Value::Function(raw) = globals.get::<Value>(name)? else {
      continue;
    };
    let expired = expired.clone();
    let guarded = lua.create_function(move |_, args: MultiValue| {
      let results: MultiValue = raw.call(args)?;
      if expired.load(Ordering::Relaxed) {
        return Err(mlua::Error::runtime(TIMEOUT_MARKER));
      }
      Ok(results)
    })?;
    globals.set(name, guarded)?;
  }
  Ok(())
}

/// Load the chunk and produce the variant's value.
fn run(
  lua: &Lua,
  source: &str,
  input: &serde_json::Value,
  variant: ExecutionVariant,
  entry_point: &str,
) -> mlua::Result<serde_json::Value> {
  lua.load(source).set_name("sandbox").exec()?;

  match variant {
    ExecutionVariant::Stdout => Ok(serde_json::Value::Null),
    ExecutionVariant::ReturnValue => {
      let entry: Value = lua.globals().get(entry_point)?;
      let Value::Function(entry) = entry else {
        return Err(mlua::Error::runtime(format!(
          "entry point '{}' is not defined as a function",
          entry_point
        )));
      };
      let input = lua.to_value(input)?;
      let result: Value = entry.call(input)?;
      Ok(lua_to_json(&result))
    }
  }
}

/// The `json` module: `json.encode(value)` and `json.decode(text)`.
fn json_module(lua: &Lua) -> mlua::Result<Table> {
  let module = lua.create_table()?;

  let encode = lua.create_function(|_, value: Value| {
    serde_json::to_string(&lua_to_json(&value)).map_err(mlua::Error::external)
  })?;
  let decode = lua.create_function(|lua, text: String| {
    let value: serde_json::Value = serde_json::from_str(&text).map_err(mlua::Error::external)?;
    lua.to_value(&value)
  })?;

  module.set("encode", encode)?;
  module.set("decode", decode)?;
  Ok(module)
}

fn setup_error(e: mlua::Error) -> SandboxError {
  SandboxError::execution(format!("failed to prepare interpreter: {}", e))
}

fn map_lua_error(e: mlua::Error, timeout: Duration) -> SandboxError {
  let message = e.to_string();
  if message.contains(TIMEOUT_MARKER) {
    SandboxError::Timeout { timeout }
  } else {
    SandboxError::execution(message)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn sandbox() -> LocalSandbox {
    LocalSandbox::new(CapabilityPolicy::default())
  }

  #[test]
  fn test_return_value_from_main() {
    let output = sandbox()
      .execute(
        "function main(input) return input.a + input.b end",
        &json!({ "a": 2, "b": 3 }),
        ExecutionVariant::ReturnValue,
        None,
      )
      .unwrap();

    assert_eq!(output.value, json!(5));
  }

  #[test]
  fn test_stdout_variant() {
    let output = sandbox()
      .execute(
        "print('hello', 1)\nprint(2.0)",
        &json!({}),
        ExecutionVariant::Stdout,
        None,
      )
      .unwrap();

    assert_eq!(output.value, json!("hello\t1\n2.0\n"));
  }

  #[test]
  fn test_print_is_captured_alongside_return_value() {
    let output = sandbox()
      .execute(
        "function main(input) print('working') return input.name end",
        &json!({ "name": "x" }),
        ExecutionVariant::ReturnValue,
        None,
      )
      .unwrap();

    assert_eq!(output.value, json!("x"));
    assert_eq!(output.stdout, "working\n");
  }

  #[test]
  fn test_runtime_error_is_execution_error() {
    let err = sandbox()
      .execute(
        "function main(input) return 1 // 0 end",
        &json!({}),
        ExecutionVariant::ReturnValue,
        None,
      )
      .unwrap_err();

    assert!(matches!(err, SandboxError::Execution { .. }));
    assert!(err.to_string().contains("attempt to perform 'n//0'"));
  }

  #[test]
  fn test_missing_entry_point() {
    let err = sandbox()
      .execute(
        "local x = 1",
        &json!({}),
        ExecutionVariant::ReturnValue,
        None,
      )
      .unwrap_err();

    assert!(err.to_string().contains("entry point 'main'"));
  }

  #[test]
  fn test_denied_globals_are_absent() {
    let output = sandbox()
      .execute(
        "function main(input) return { os = type(os), io = type(io), load = type(load) } end",
        &json!({}),
        ExecutionVariant::ReturnValue,
        None,
      )
      .unwrap();

    assert_eq!(output.value, json!({ "os": "nil", "io": "nil", "load": "nil" }));
  }

  #[test]
  fn test_scan_finding_prevents_execution() {
    let err = sandbox()
      .execute(
        "print('side effect')\nos.remove('/tmp/x')",
        &json!({}),
        ExecutionVariant::Stdout,
        None,
      )
      .unwrap_err();

    match err {
      SandboxError::SecurityScan { findings } => {
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line, 2);
      }
      other => panic!("expected scan failure, got {other:?}"),
    }
  }

  #[test]
  fn test_dynamic_require_outside_allow_list_fails() {
    let err = sandbox()
      .execute(
        "function main(input) local name = 'o' .. 's' return require(name) end",
        &json!({}),
        ExecutionVariant::ReturnValue,
        None,
      )
      .unwrap_err();

    assert!(err.to_string().contains("module 'os' is not allowed"));
  }

  #[test]
  fn test_json_module() {
    let output = sandbox()
      .execute(
        r#"
local json = require("json")
function main(input)
  local decoded = json.decode('{"k": [1, 2]}')
  return json.encode({ sum = decoded.k[1] + decoded.k[2] })
end
"#,
        &json!({}),
        ExecutionVariant::ReturnValue,
        None,
      )
      .unwrap();

    assert_eq!(output.value, json!(r#"{"sum":3}"#));
  }

  #[test]
  fn test_infinite_loop_times_out() {
    let err = sandbox()
      .execute(
        "while true do end",
        &json!({}),
        ExecutionVariant::Stdout,
        Some(Duration::from_millis(100)),
      )
      .unwrap_err();

    assert!(err.is_timeout());
  }

  #[test]
  fn test_pcall_cannot_swallow_timeout() {
    let err = sandbox()
      .execute(
        "while true do pcall(function() while true do end end) end",
        &json!({}),
        ExecutionVariant::Stdout,
        Some(Duration::from_millis(100)),
      )
      .unwrap_err();

    assert!(err.is_timeout());
  }

  #[test]
  fn test_xpcall_handler_cannot_swallow_timeout() {
    let err = sandbox()
      .execute(
        "while true do xpcall(function() while true do end end, function(e) return e end) end",
        &json!({}),
        ExecutionVariant::Stdout,
        Some(Duration::from_millis(100)),
      )
      .unwrap_err();

    assert!(err.is_timeout());
  }

  #[test]
  fn test_pcall_still_catches_ordinary_errors() {
    let output = sandbox()
      .execute(
        "function main(input) local ok, err = pcall(error, 'boom') return { ok = ok, err = err } end",
        &json!({}),
        ExecutionVariant::ReturnValue,
        None,
      )
      .unwrap();

    assert_eq!(output.value, json!({ "ok": false, "err": "boom" }));
  }

  #[test]
  fn test_input_arrays_and_nulls() {
    let output = sandbox()
      .execute(
        "function main(input) return { n = #input.items } end",
        &json!({ "items": [1, 2, 3], "none": null }),
        ExecutionVariant::ReturnValue,
        None,
      )
      .unwrap();

    assert_eq!(output.value["n"], json!(3));
  }
}
