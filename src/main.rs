use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pipewright_config::PipelineDef;
use pipewright_sandbox::{ProcessProviderConfig, ProcessSessionProvider};
use pipewright_step::{Services, Step, StepRegistry, StepResult};

/// Pipewright - step pipelines with sandboxed code execution
#[derive(Parser)]
#[command(name = "pipewright")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Python interpreter for remote sessions
  #[arg(long, global = true, default_value = "python3")]
  python: String,

  /// Lifetime of remote sessions in seconds (capped at 3600)
  #[arg(long, global = true, default_value_t = 300)]
  session_lifetime: u64,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a pipeline or one of its steps
  Run {
    #[command(subcommand)]
    target: RunTarget,
  },
}

#[derive(Subcommand)]
enum RunTarget {
  /// Run an entire pipeline
  Pipeline {
    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,
  },

  /// Run a single top-level step of a pipeline
  Step {
    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,

    /// Name of the step to execute
    #[arg(long)]
    name: String,

    /// Print intermediate envelopes as they are produced
    #[arg(long)]
    stream: bool,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();
  let Some(Commands::Run { target }) = cli.command else {
    println!("pipewright - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  let provider = Arc::new(ProcessSessionProvider::new(ProcessProviderConfig {
    program: cli.python,
    ..ProcessProviderConfig::default()
  }));
  let services = Services {
    session_timeout: Some(Duration::from_secs(cli.session_lifetime)),
    ..Services::default()
  }
  .with_session_provider(provider.clone());

  let outcome = rt.block_on(async {
    let result = match target {
      RunTarget::Pipeline { pipeline_file } => run_pipeline(&pipeline_file, &services).await,
      RunTarget::Step {
        pipeline_file,
        name,
        stream,
      } => run_step(&pipeline_file, &name, stream, &services).await,
    };
    provider.shutdown().await;
    info!("session_provider_shutdown");
    result
  });

  if !report(outcome)? {
    std::process::exit(1);
  }
  Ok(())
}

/// Log how the run ended. `Ok(false)` means the run produced an error envelope.
fn report(outcome: Result<StepResult>) -> Result<bool> {
  match outcome {
    Ok(result) if result.is_error() => {
      warn!("run_completed_with_error");
      Ok(false)
    }
    Ok(_) => {
      info!("run_completed");
      Ok(true)
    }
    Err(e) => {
      error!(error = %e, "run_failed");
      Err(e)
    }
  }
}

async fn run_pipeline(pipeline_file: &Path, services: &Services) -> Result<StepResult> {
  let pipeline = load_pipeline(pipeline_file).await?;
  let payload = read_payload_from_stdin()?;

  let chain = StepRegistry::new()
    .build_pipeline(&pipeline, services)
    .context("failed to build pipeline")?;
  info!(
    pipeline = %pipeline.name,
    steps = chain.steps().len(),
    "pipeline_loaded"
  );

  let result = Arc::new(chain).execute_async(payload).await;
  print_envelope(&result)?;
  Ok(result)
}

async fn run_step(
  pipeline_file: &Path,
  name: &str,
  stream: bool,
  services: &Services,
) -> Result<StepResult> {
  let pipeline = load_pipeline(pipeline_file).await?;
  let def = pipeline
    .steps
    .iter()
    .find(|s| s.name.as_deref() == Some(name))
    .with_context(|| format!("step '{}' not found in pipeline", name))?;
  let payload = read_payload_from_stdin()?;

  let step = StepRegistry::new()
    .build(def, services)
    .with_context(|| format!("failed to build step '{}'", name))?;
  info!(step = %name, kind = %def.kind, stream, "step_started");

  if !stream {
    let result = step.execute_async(payload).await;
    print_envelope(&result)?;
    return Ok(result);
  }

  let mut chunks = step.execute_stream(payload);
  while let Some(chunk) = chunks.next().await {
    println!("{}", serde_json::to_string(&chunk)?);
    if chunk.is_terminal() {
      return Ok(chunk);
    }
  }
  bail!("step '{}' ended without a terminal result", name)
}

async fn load_pipeline(pipeline_file: &Path) -> Result<PipelineDef> {
  let content = tokio::fs::read_to_string(pipeline_file)
    .await
    .with_context(|| format!("failed to read pipeline file: {}", pipeline_file.display()))?;

  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse pipeline file: {}", pipeline_file.display()))
}

fn print_envelope(result: &StepResult) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(result)?);
  Ok(())
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(serde_json::json!({}));
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read payload from stdin")?;

  if input.trim().is_empty() {
    Ok(serde_json::json!({}))
  } else {
    serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[derive(Clone, Default)]
  struct Captured(Arc<Mutex<Vec<u8>>>);

  impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  fn logged(outcome: Result<StepResult>) -> (Result<bool>, String) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
      .with_writer(move || writer.clone())
      .with_ansi(false)
      .finish();
    let reported = tracing::subscriber::with_default(subscriber, || report(outcome));
    let text = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    (reported, text)
  }

  #[test]
  fn test_report_logs_run_lifecycle() {
    let (reported, text) = logged(Ok(StepResult::success(serde_json::json!(1))));
    assert!(reported.unwrap());
    assert!(text.contains("run_completed"));

    let (reported, text) = logged(Ok(StepResult::error("boom")));
    assert!(!reported.unwrap());
    assert!(text.contains("run_completed_with_error"));

    let (reported, text) = logged(Err(anyhow::anyhow!("missing file")));
    assert!(reported.is_err());
    assert!(text.contains("run_failed"));
    assert!(text.contains("missing file"));
  }
}
