//! End-to-end pipeline behavior: chains, loops and conditionals built from
//! definitions, run against the local sandbox and a scripted remote session.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pipewright_config::{PipelineDef, StepDef};
use pipewright_sandbox::testing::{ScriptedProvider, ScriptedReply};
use pipewright_step::{
  Chain, ChannelNotifier, ExecutionEvent, LoopSource, LoopStep, Services, Step, StepRegistry,
  StepResult, StepStatus,
};
use serde_json::json;

fn build(def: serde_json::Value, services: &Services) -> Arc<dyn Step> {
  let def: StepDef = serde_json::from_value(def).unwrap();
  StepRegistry::new().build(&def, services).unwrap()
}

fn scripted(provider: ScriptedProvider) -> (Arc<ScriptedProvider>, Services) {
  let provider = Arc::new(provider);
  let services = Services::default().with_session_provider(provider.clone());
  (provider, services)
}

#[tokio::test]
async fn test_chain_threads_context_between_local_steps() {
  let chain = build(
    json!({
      "type": "chain",
      "steps": [
        { "type": "code_execution", "name": "a", "code": "function main(input) return 1 end" },
        { "type": "code_execution", "name": "b", "code": "function main(input) return input.a + 1 end" }
      ]
    }),
    &Services::default(),
  );

  let result = chain.execute_async(json!({})).await;

  assert!(result.is_success(), "{:?}", result);
  assert_eq!(result.data["chain_output"]["data"], json!(2));
  let outputs = result.data["all_steps_output"].as_object().unwrap();
  assert!(outputs.contains_key("a"));
  assert!(outputs.contains_key("b"));
}

#[tokio::test]
async fn test_local_runtime_error_is_error_result() {
  let step = build(
    json!({ "type": "code_execution", "code": "function main(input) return 1 // 0 end" }),
    &Services::default(),
  );

  let result = step.execute_async(json!({})).await;

  assert_eq!(result.status, StepStatus::Error);
  assert_eq!(result.metadata["error_kind"], "execution");
  assert!(result.data.as_str().unwrap().contains("attempt to perform 'n//0'"));
}

#[tokio::test]
async fn test_disallowed_module_never_executes() {
  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let services = Services::default().with_notifier(Arc::new(ChannelNotifier::new(tx)));
  let step = build(
    json!({
      "type": "code_execution",
      "variant": "stdout",
      "code": "print('side effect')\nlocal os = require('os')\nfunction main(input) return 1 end"
    }),
    &services,
  );

  let result = step.execute_async(json!({})).await;

  assert!(result.is_error());
  assert!(result.data.as_str().unwrap().contains("module-import"));
  while let Ok(event) = rx.try_recv() {
    assert!(!matches!(event, ExecutionEvent::SandboxOutput { .. }));
  }
}

#[tokio::test]
async fn test_repeat_loop_returns_indices() {
  let step = build(
    json!({
      "type": "loop",
      "mode": "repeat",
      "loop_count": 3,
      "execution_mode": "sequential",
      "body": [{ "type": "template", "name": "i", "output": "{{ index }}" }]
    }),
    &Services::default(),
  );

  let result = step.execute_async(json!({})).await;

  assert_eq!(result.data, json!([0, 1, 2]));
}

/// Sleeps a pseudo-random time derived from its index, then returns the item.
struct Jittered;

impl Step for Jittered {
  fn kind(&self) -> &'static str {
    "jittered"
  }

  fn name(&self) -> Option<&str> {
    Some("value")
  }

  fn execute(&self, input: &serde_json::Value) -> StepResult {
    let index = input["index"].as_u64().unwrap_or(0);
    std::thread::sleep(Duration::from_millis((index * 7919 % 13) * 3));
    StepResult::success(input["item"].clone())
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_map_preserves_source_order() {
  let items: Vec<i64> = (0..20).collect();

  for concurrency in [1, 3, 8, 32] {
    let step = Arc::new(
      LoopStep::new(
        None,
        LoopSource::Map("{{ items }}".to_string()),
        vec![Arc::new(Jittered)],
      )
      .parallel(concurrency),
    );

    let result = step.execute_async(json!({ "items": items })).await;

    assert!(result.is_success());
    assert_eq!(result.data, json!(items), "concurrency {}", concurrency);
  }
}

#[tokio::test]
async fn test_loop_stop_and_fail_reports_error() {
  let step = build(
    json!({
      "type": "loop",
      "mode": "map",
      "source": "{{ divisors }}",
      "body": [{
        "type": "code_execution",
        "name": "q",
        "code": "function main(input) return 10 // input.item end"
      }]
    }),
    &Services::default(),
  );

  let result = step.execute_async(json!({ "divisors": [5, 0, 2] })).await;

  assert!(result.is_error());
  assert!(result.data.as_str().unwrap().starts_with("iteration 1 failed"));
  let iterations = result.metadata["iterations"].as_array().unwrap();
  assert_eq!(iterations[0]["data"], json!(2));
  assert_eq!(iterations[2], json!(null));
}

#[tokio::test]
async fn test_conditional_runs_only_first_true_branch() {
  let (provider, services) = scripted(
    ScriptedProvider::new()
      .reply("eval(\"score > 10\"", ScriptedReply::new().stdout("False\n"))
      .reply("eval(\"score > 5\"", ScriptedReply::new().stdout("True\n")),
  );
  let step = build(
    json!({
      "type": "conditional",
      "name": "grade",
      "session_id": "grading",
      "branches": [
        { "condition": "score > 10", "steps": [{ "type": "template", "name": "b1", "output": "high" }] },
        { "condition": "score > 5", "steps": [{ "type": "template", "name": "b2", "output": "mid" }] },
        { "condition": "else", "steps": [{ "type": "template", "name": "b3", "output": "low" }] }
      ]
    }),
    &services,
  );

  let result = step.execute_async(json!({ "score": 7 })).await;

  assert!(result.is_success());
  assert_eq!(result.data, json!("mid"));
  assert_eq!(result.metadata["branch"], json!(1));
  let outputs = result.metadata["all_steps_output"].as_object().unwrap();
  assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["b2"]);

  let calls = provider.calls("grading");
  assert_eq!(calls.len(), 2);
  assert!(calls.iter().all(|c| c.contains(r#"{"score": 7}"#)));
  assert!(calls[0].contains(r#"eval("score > 10""#));
  assert!(calls[1].contains(r#"eval("score > 5""#));
}

#[tokio::test]
async fn test_conditional_without_match_or_else_fails() {
  let (_, services) = scripted(ScriptedProvider::new());
  let step = build(
    json!({
      "type": "conditional",
      "branches": [{ "condition": "flag", "steps": [{ "type": "template", "output": 1 }] }]
    }),
    &services,
  );

  let result = step.execute_async(json!({})).await;

  assert!(result.is_error());
  assert_eq!(result.data, json!("no matching branch"));
}

#[tokio::test]
async fn test_remote_exports_reach_later_steps() {
  let (_, services) = scripted(ScriptedProvider::new().reply(
    "x = 42",
    ScriptedReply::new()
      .stdout("ok\n")
      .set("x", json!(42))
      .set("y", json!("hello")),
  ));
  let chain = build(
    json!({
      "type": "chain",
      "steps": [
        {
          "type": "code_execution",
          "name": "setup",
          "backend": "remote",
          "session_id": "exports",
          "variant": "stdout",
          "code": "x = 42\ny = 'hello'"
        },
        {
          "type": "template",
          "name": "check",
          "output": { "x": "{{ x }}", "y": "{{ y }}", "x_str": "{{ x_str }}" }
        }
      ]
    }),
    &services,
  );

  let result = chain.execute_async(json!({})).await;

  assert!(result.is_success(), "{:?}", result);
  assert_eq!(
    result.data["chain_output"]["data"],
    json!({ "x": 42, "y": "hello", "x_str": "42" })
  );
  assert_eq!(result.data["all_steps_output"]["setup"]["data"], json!("ok"));
  assert_eq!(result.exported_variables()["x"], json!(42));
}

#[tokio::test]
async fn test_remote_return_value_reads_result_global() {
  let (_, services) = scripted(
    ScriptedProvider::new().reply("result =", ScriptedReply::new().set("result", json!([1, 2]))),
  );
  let step = build(
    json!({
      "type": "code_execution",
      "backend": "remote",
      "code": "result = [a, b]"
    }),
    &services,
  );

  let result = step.execute_async(json!({ "a": 1, "b": 2 })).await;

  assert_eq!(result.data, json!([1, 2]));
  assert_eq!(result.metadata["backend"], "remote");
}

#[tokio::test]
async fn test_remote_return_value_is_not_carried_over() {
  let (_, services) = scripted(
    ScriptedProvider::new()
      .reply("result = 7", ScriptedReply::new().set("result", json!(7)))
      .reply("print('plain')", ScriptedReply::new().stdout("plain\n")),
  );
  let chain = build(
    json!({
      "type": "chain",
      "steps": [
        { "type": "code_execution", "name": "first", "backend": "remote", "session_id": "ret", "code": "result = 7" },
        { "type": "code_execution", "name": "second", "backend": "remote", "session_id": "ret", "code": "print('plain')" }
      ]
    }),
    &services,
  );

  let result = chain.execute_async(json!({})).await;

  assert!(result.is_success(), "{:?}", result);
  assert_eq!(result.data["all_steps_output"]["first"]["data"], json!(7));
  assert_eq!(result.data["chain_output"]["data"], json!("plain"));
}

#[tokio::test]
async fn test_parallel_loop_shares_one_remote_session() {
  let (provider, services) = scripted(ScriptedProvider::new().reply(
    "time.sleep",
    ScriptedReply::new().delay(Duration::from_millis(20)).stdout("done\n"),
  ));
  let step = build(
    json!({
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
        "code": "import time\ntime.sleep(0.02)\nprint(item)"
      }]
    }),
    &services,
  );

  let result = step
    .execute_async(json!({ "items": [0, 1, 2, 3, 4, 5, 6, 7] }))
    .await;

  assert!(result.is_success(), "{:?}", result);
  assert_eq!(result.data.as_array().unwrap().len(), 8);
  assert_eq!(provider.created_sessions(), 1);

  let calls = provider.calls("pipewright-c");
  assert_eq!(calls.len(), 16);
  let mut seen: Vec<String> = Vec::new();
  for pair in calls.chunks(2) {
    let item_line = pair[0]
      .lines()
      .find(|l| l.starts_with("item = "))
      .unwrap()
      .to_string();
    assert!(pair[1].contains("time.sleep"));
    seen.push(item_line);
  }
  seen.sort();
  let expected: Vec<String> = (0..8).map(|i| format!("item = {}", i)).collect();
  assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_streaming_chunks_concatenate_to_stdout() {
  let (_, services) = scripted(ScriptedProvider::new().reply(
    "for i in range(3)",
    ScriptedReply::new().stdout("0\n1").stdout("\n2\n").stdout("tail"),
  ));
  let step = build(
    json!({
      "type": "code_execution",
      "backend": "remote",
      "stream": true,
      "variant": "stdout",
      "code": "for i in range(3):\n    print(i)"
    }),
    &services,
  );

  let chunks: Vec<StepResult> = step.execute_stream(json!({})).collect().await;

  let (progress, terminal): (Vec<_>, Vec<_>) = chunks.iter().partition(|c| !c.is_terminal());
  assert_eq!(terminal.len(), 1);
  assert!(chunks.last().unwrap().is_terminal());
  let text: String = progress
    .iter()
    .map(|c| c.data.as_str().unwrap())
    .collect();
  assert_eq!(text, "0\n1\n2\ntail");
  assert_eq!(text, terminal[0].metadata["stdout"]);
  assert_eq!(progress.len(), 4);
}

#[tokio::test]
async fn test_session_init_failure_is_terminal_error() {
  let (_, services) = scripted(ScriptedProvider::failing());
  let step = build(
    json!({ "type": "code_execution", "backend": "remote", "code": "print(1)" }),
    &services,
  );

  let result = step.execute_async(json!({})).await;

  assert!(result.is_error());
  assert_eq!(result.metadata["error_kind"], "sandbox_init");
}

#[tokio::test]
async fn test_pure_pipeline_is_idempotent() {
  let pipeline: PipelineDef = serde_json::from_value(json!({
    "name": "pure",
    "steps": [
      { "type": "template", "name": "greeting", "output": "hello {{ who }}" },
      {
        "type": "loop",
        "name": "shout",
        "mode": "map",
        "source": "{{ names }}",
        "execution_mode": "parallel",
        "concurrency": 2,
        "body": [{ "type": "template", "name": "s", "output": "{{ greeting }}, {{ item | upper }}" }]
      }
    ]
  }))
  .unwrap();
  let chain: Arc<Chain> = Arc::new(
    StepRegistry::new()
      .build_pipeline(&pipeline, &Services::default())
      .unwrap(),
  );
  let input = json!({ "who": "world", "names": ["ada", "lin"] });

  let first = chain.clone().execute_async(input.clone()).await;
  let second = chain.execute_async(input).await;

  assert!(first.is_success());
  assert_eq!(first.data, second.data);
  assert_eq!(
    first.data["chain_output"]["data"],
    json!(["hello world, ADA", "hello world, LIN"])
  );
}

#[tokio::test]
async fn test_notifier_sees_step_lifecycle() {
  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let services = Services::default().with_notifier(Arc::new(ChannelNotifier::new(tx)));
  let chain = build(
    json!({
      "type": "chain",
      "name": "observed",
      "steps": [{ "type": "template", "name": "only", "output": 1 }]
    }),
    &services,
  );

  chain.execute_async(json!({})).await;

  let mut events = Vec::new();
  while let Ok(event) = rx.try_recv() {
    events.push(event);
  }
  assert!(matches!(events.first(), Some(ExecutionEvent::ChainStarted { chain, .. }) if chain == "observed"));
  assert!(events.iter().any(|e| matches!(e, ExecutionEvent::StepCompleted { step, .. } if step == "only")));
  assert!(matches!(events.last(), Some(ExecutionEvent::ChainCompleted { .. })));
}

#[tokio::test]
async fn test_loop_body_steps_reach_notifier() {
  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let services = Services::default().with_notifier(Arc::new(ChannelNotifier::new(tx)));
  let step = build(
    json!({
      "type": "loop",
      "name": "twice",
      "mode": "repeat",
      "loop_count": 2,
      "body": [{ "type": "template", "name": "inner", "output": "{{ index }}" }]
    }),
    &services,
  );

  step.execute_async(json!({})).await;

  let mut started = Vec::new();
  let mut completed = 0;
  while let Ok(event) = rx.try_recv() {
    match event {
      ExecutionEvent::StepStarted { execution_id, step } => {
        assert_eq!(step, "inner");
        started.push(execution_id);
      }
      ExecutionEvent::StepCompleted { step, .. } if step == "inner" => completed += 1,
      other => panic!("unexpected event {other:?}"),
    }
  }
  assert_eq!(started.len(), 2);
  assert_eq!(started[0], started[1]);
  assert_eq!(completed, 2);
}

#[tokio::test]
async fn test_non_object_input_is_validation_error() {
  for step in [
    build(json!({ "type": "template", "output": 1 }), &Services::default()),
    build(
      json!({ "type": "loop", "mode": "repeat", "loop_count": 1, "body": [{ "type": "template", "output": 1 }] }),
      &Services::default(),
    ),
  ] {
    let result = step.execute_async(json!([1, 2, 3])).await;
    assert_eq!(result.metadata["error_kind"], "validation");
  }
}
