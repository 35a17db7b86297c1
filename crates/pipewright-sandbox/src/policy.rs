//! Capability policy for the local interpreter.

use std::collections::BTreeSet;
use std::time::Duration;

const DEFAULT_GLOBALS: &[&str] = &[
  "_VERSION", "assert", "error", "ipairs", "math", "next", "pairs", "pcall", "print", "rawequal",
  "rawlen", "require", "select", "string", "table", "tonumber", "tostring", "type", "utf8",
  "xpcall",
];

const DEFAULT_MODULES: &[&str] = &["json", "math", "string", "table", "utf8"];

/// What sandboxed code may touch.
///
/// Everything not listed is removed from the interpreter before user code
/// runs. `require` only resolves names in `allowed_modules`.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityPolicy {
  pub allowed_globals: BTreeSet<String>,
  pub allowed_modules: BTreeSet<String>,
  /// Interpreter memory ceiling in bytes.
  pub memory_limit: Option<usize>,
  /// Wall-clock ceiling for one execution.
  pub timeout: Duration,
  /// Function called with the input table in the return-value variant.
  pub entry_point: String,
}

impl Default for CapabilityPolicy {
  fn default() -> Self {
    Self {
      allowed_globals: DEFAULT_GLOBALS.iter().map(|s| s.to_string()).collect(),
      allowed_modules: DEFAULT_MODULES.iter().map(|s| s.to_string()).collect(),
      memory_limit: Some(64 * 1024 * 1024),
      timeout: Duration::from_secs(30),
      entry_point: "main".to_string(),
    }
  }
}

impl CapabilityPolicy {
  pub fn allows_global(&self, name: &str) -> bool {
    self.allowed_globals.contains(name)
  }

  pub fn allows_module(&self, name: &str) -> bool {
    self.allowed_modules.contains(name)
  }

  /// Allow an additional global.
  pub fn with_global(mut self, name: impl Into<String>) -> Self {
    self.allowed_globals.insert(name.into());
    self
  }

  /// Remove a module from the allow-list.
  pub fn without_module(mut self, name: &str) -> Self {
    self.allowed_modules.remove(name);
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}
