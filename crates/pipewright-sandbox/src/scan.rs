//! Static security scan over sandbox source text.
//!
//! Runs before the interpreter is created. Any finding aborts the execution,
//! so flagged code never runs. Matching is textual and line based; it errs on
//! the side of rejecting.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::policy::CapabilityPolicy;

struct Rule {
  id: &'static str,
  description: &'static str,
  pattern: Regex,
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
  [
    (
      "dynamic-load",
      "dynamic code loading",
      r"\b(load|loadstring|dofile|loadfile)\s*[\(\x22'\[{]",
    ),
    ("debug-access", "debug library access", r"\bdebug\s*[\.\[]"),
    ("os-access", "operating system access", r"\bos\s*[\.\[]"),
    ("io-access", "file and stream access", r"\bio\s*[\.\[]"),
    ("package-access", "module loader access", r"\bpackage\s*[\.\[]"),
    ("env-access", "global environment access", r"\b(_G|_ENV)\b"),
    (
      "metatable",
      "metatable manipulation",
      r"\b(setmetatable|getmetatable|rawset|rawget)\s*\(",
    ),
    ("bytecode", "bytecode dump", r"\bstring\s*\.\s*dump\b"),
    ("gc-control", "garbage collector control", r"\bcollectgarbage\s*\("),
  ]
  .into_iter()
  .map(|(id, description, pattern)| Rule {
    id,
    description,
    pattern: Regex::new(pattern).expect("static scan pattern must compile"),
  })
  .collect()
});

static REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#"\brequire\s*\(?\s*["']([A-Za-z0-9_.]+)["']"#)
    .expect("static require pattern must compile")
});

/// A single scan hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFinding {
  /// 1-based line number.
  pub line: usize,
  pub rule: &'static str,
  pub description: String,
  /// The offending line, trimmed.
  pub snippet: String,
}

impl fmt::Display for ScanFinding {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "line {}: {} [{}]: {}",
      self.line, self.description, self.rule, self.snippet
    )
  }
}

/// Scan source text against the fixed rules and the policy's module list.
pub fn scan(source: &str, policy: &CapabilityPolicy) -> Vec<ScanFinding> {
  let mut findings = Vec::new();

  for (index, line) in source.lines().enumerate() {
    let code = line.trim();
    if code.is_empty() || code.starts_with("--") {
      continue;
    }

    for rule in RULES.iter() {
      if rule.pattern.is_match(code) {
        findings.push(ScanFinding {
          line: index + 1,
          rule: rule.id,
          description: rule.description.to_string(),
          snippet: code.to_string(),
        });
      }
    }

    for capture in REQUIRE.captures_iter(code) {
      let module = &capture[1];
      if !policy.allows_module(module) {
        findings.push(ScanFinding {
          line: index + 1,
          rule: "module-import",
          description: format!("import of module '{}' outside the allow-list", module),
          snippet: code.to_string(),
        });
      }
    }
  }

  findings
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rules_hit(source: &str) -> Vec<&'static str> {
    scan(source, &CapabilityPolicy::default())
      .into_iter()
      .map(|f| f.rule)
      .collect()
  }

  #[test]
  fn test_clean_code_passes() {
    let source = r#"
function main(input)
  local ratio = input.a / input.b
  local words = string.upper("load data")
  return { ratio = ratio, words = words }
end
"#;
    assert!(rules_hit(source).is_empty());
  }

  #[test]
  fn test_flags_os_and_io() {
    assert_eq!(rules_hit("os.execute('rm -rf /')"), vec!["os-access"]);
    assert_eq!(rules_hit("local f = io.open('x')"), vec!["io-access"]);
  }

  #[test]
  fn test_flags_dynamic_loading() {
    assert_eq!(rules_hit("load('return 1')()"), vec!["dynamic-load"]);
    assert_eq!(rules_hit("dofile \"x.lua\""), vec!["dynamic-load"]);
  }

  #[test]
  fn test_flags_environment_and_metatables() {
    assert_eq!(rules_hit("_G.print = nil"), vec!["env-access"]);
    assert_eq!(
      rules_hit("getmetatable('').__index = nil"),
      vec!["metatable"]
    );
    assert_eq!(rules_hit("string.dump(main)"), vec!["bytecode"]);
  }

  #[test]
  fn test_flags_disallowed_require() {
    let findings = scan(
      "local json = require('json')\nlocal socket = require \"socket\"",
      &CapabilityPolicy::default(),
    );

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].line, 2);
    assert_eq!(findings[0].rule, "module-import");
    assert!(findings[0].description.contains("socket"));
  }

  #[test]
  fn test_comment_lines_are_skipped() {
    assert!(rules_hit("-- os.execute is not allowed here").is_empty());
  }

  #[test]
  fn test_finding_display() {
    let findings = scan("\n  os.exit(1)", &CapabilityPolicy::default());
    assert_eq!(
      findings[0].to_string(),
      "line 2: operating system access [os-access]: os.exit(1)"
    );
  }
}
