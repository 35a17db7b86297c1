//! Pipelines against real python worker sessions.
//!
//! Skipped when no `python3` is on PATH.

use std::sync::Arc;

use pipewright_config::StepDef;
use pipewright_sandbox::{ProcessProviderConfig, ProcessSessionProvider};
use pipewright_step::{Services, StepRegistry};
use serde_json::json;

fn python_available() -> bool {
  std::process::Command::new("python3")
    .arg("--version")
    .output()
    .map(|o| o.status.success())
    .unwrap_or(false)
}

fn services(name: &str) -> (Arc<ProcessSessionProvider>, Services) {
  let provider = Arc::new(ProcessSessionProvider::new(ProcessProviderConfig {
    working_root: std::env::temp_dir()
      .join("pipewright-step-tests")
      .join(format!("{}-{}", name, std::process::id())),
    ..ProcessProviderConfig::default()
  }));
  let services = Services::default().with_session_provider(provider.clone());
  (provider, services)
}

#[tokio::test]
async fn test_chain_with_exports_and_conditional() {
  if !python_available() {
    eprintln!("Skipping test: python3 not found");
    return;
  }

  let (provider, services) = services("chain");
  let def: StepDef = serde_json::from_value(json!({
    "type": "chain",
    "name": "scoring",
    "steps": [
      {
        "type": "code_execution",
        "name": "compute",
        "backend": "remote",
        "session_id": "scoring-{{ run }}",
        "code": "import threading\nscore = len(text.split())\nhandle = threading.Lock()\nresult = {'words': score}"
      },
      {
        "type": "conditional",
        "name": "grade",
        "branches": [
          { "condition": "score > 3", "steps": [{ "type": "template", "name": "label", "output": "long ({{ score }})" }] },
          { "condition": "else", "steps": [{ "type": "template", "name": "label", "output": "short" }] }
        ]
      }
    ]
  }))
  .unwrap();
  let chain = StepRegistry::new().build(&def, &services).unwrap();

  let result = chain
    .execute_async(json!({ "run": 1, "text": "one two three four five" }))
    .await;

  assert!(result.is_success(), "{:?}", result);
  let compute = &result.data["all_steps_output"]["compute"];
  assert_eq!(compute["data"], json!({ "words": 5 }));
  let exported = compute["metadata"]["exported_variables"].as_object().unwrap();
  assert_eq!(exported["score"], json!(5));
  assert!(!exported.contains_key("handle"));
  assert_eq!(result.data["chain_output"]["data"], json!("long (5)"));

  provider.shutdown().await;
}

#[tokio::test]
async fn test_shell_failure_names_command() {
  if !python_available() {
    eprintln!("Skipping test: python3 not found");
    return;
  }

  let (provider, services) = services("shell");
  let def = StepDef::new(
    "code_execution",
    Some("sh"),
    json!({ "backend": "remote", "code": "!echo ready\n!exit 4\n!echo unreachable" }),
  );
  let step = StepRegistry::new().build(&def, &services).unwrap();

  let result = step.execute_async(json!({})).await;

  assert!(result.is_error());
  let message = result.data.as_str().unwrap();
  assert!(message.contains("`exit 4` exited with code 4"), "{}", message);
  assert_eq!(result.metadata["stdout"], "ready\n");

  provider.shutdown().await;
}

#[tokio::test]
async fn test_parallel_loop_over_shared_session() {
  if !python_available() {
    eprintln!("Skipping test: python3 not found");
    return;
  }

  let (provider, services) = services("parallel");
  let def: StepDef = serde_json::from_value(json!({
    "type": "loop",
    "mode": "map",
    "source": "{{ items }}",
    "execution_mode": "parallel",
    "concurrency": 8,
    "body": [{
      "type": "code_execution",
      "name": "c",
      "backend": "remote",
      "variant": "stdout",
      "code": "import time\ntime.sleep(0.05)\nprint(item)"
    }]
  }))
  .unwrap();
  let step = StepRegistry::new().build(&def, &services).unwrap();

  let result = step
    .execute_async(json!({ "items": ["a", "b", "c", "d", "e", "f", "g", "h"] }))
    .await;

  assert!(result.is_success(), "{:?}", result);
  assert_eq!(result.data, json!(["a", "b", "c", "d", "e", "f", "g", "h"]));

  provider.shutdown().await;
}

#[tokio::test]
async fn test_condition_fails_closed_after_admitted_run() {
  if !python_available() {
    eprintln!("Skipping test: python3 not found");
    return;
  }

  let (provider, services) = services("stale-condition");
  let def: StepDef = serde_json::from_value(json!({
    "type": "conditional",
    "name": "gate",
    "branches": [
      { "condition": "x > 1", "steps": [{ "type": "template", "name": "hit", "output": "admitted" }] }
    ]
  }))
  .unwrap();
  let step = StepRegistry::new().build(&def, &services).unwrap();

  let admitted = step.clone().execute_async(json!({ "x": 5 })).await;
  assert!(admitted.is_success(), "{:?}", admitted);
  assert_eq!(admitted.data, json!("admitted"));

  let missing = step.execute_async(json!({})).await;
  assert!(missing.is_error());
  assert_eq!(missing.data, json!("no matching branch"));

  provider.shutdown().await;
}

#[tokio::test]
async fn test_non_finite_float_does_not_drop_exports() {
  if !python_available() {
    eprintln!("Skipping test: python3 not found");
    return;
  }

  let (provider, services) = services("nan");
  let def = StepDef::new(
    "code_execution",
    Some("floats"),
    json!({ "backend": "remote", "code": "x = 42\ny = 'hello'\nz = float('nan')" }),
  );
  let step = StepRegistry::new().build(&def, &services).unwrap();

  let result = step.execute_async(json!({})).await;

  assert!(result.is_success(), "{:?}", result);
  let exported = result.exported_variables();
  assert_eq!(exported["x"], json!(42));
  assert_eq!(exported["y"], json!("hello"));
  assert!(!exported.contains_key("z"));

  provider.shutdown().await;
}
