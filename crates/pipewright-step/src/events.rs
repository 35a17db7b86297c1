//! Execution events and notifiers for observability.
//!
//! Each chain invocation reports progress to the notifier it was built with.
//! Captured sandbox output travels the same way, so concurrent invocations
//! never share a capture buffer.

use pipewright_sandbox::OutputStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted while steps execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A chain invocation has started.
  ChainStarted { execution_id: String, chain: String },

  /// A step within a chain has started.
  StepStarted { execution_id: String, step: String },

  /// A step within a chain has completed successfully.
  StepCompleted {
    execution_id: String,
    step: String,
    data: serde_json::Value,
  },

  /// A step within a chain has failed.
  StepFailed {
    execution_id: String,
    step: String,
    error: String,
  },

  /// Output produced by sandboxed code while it runs.
  SandboxOutput {
    step: String,
    stream: OutputStream,
    text: String,
  },

  /// A chain invocation has completed successfully.
  ChainCompleted { execution_id: String, chain: String },

  /// A chain invocation has failed.
  ChainFailed {
    execution_id: String,
    chain: String,
    error: String,
  },
}

/// Trait for receiving execution events.
///
/// Implementations decide what to do with them (persist, broadcast, log,
/// ignore, etc.).
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls step execution.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
