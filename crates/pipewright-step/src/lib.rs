//! Pipewright Step
//!
//! The step contract and everything built on it.
//!
//! Every unit of work implements [`Step`] and reports a [`StepResult`]
//! envelope (`success`, `error` or `in_progress`). Failures never escape as
//! panics or `Err`; they become error envelopes so the composition layer can
//! continue, branch or halt by policy.
//!
//! Leaf steps:
//! - [`CodeExecutionStep`]: user code in the local Lua sandbox or a remote
//!   Python session
//! - [`TemplateStep`]: renders a templated JSON value
//! - [`CompletionStep`]: calls an external [`CompletionService`]
//!
//! Composite steps:
//! - [`Chain`]: ordered sequence over one shared [`Context`]
//! - [`ConditionalStep`]: runs the first branch whose condition holds
//! - [`LoopStep`]: map or repeat over a body, bounded concurrency, ordered
//!   results
//!
//! [`StepRegistry`] builds steps from `pipewright-config` definitions.

mod bridge;
mod chain;
mod code;
mod completion;
mod conditional;
mod context;
mod error;
mod events;
mod loops;
mod registry;
mod result;
mod step;
mod template_step;

pub use chain::Chain;
pub use code::CodeExecutionStep;
pub use completion::{
  CompletionError, CompletionMessage, CompletionRequest, CompletionService, CompletionStep,
};
pub use conditional::{Branch, ConditionalStep};
pub use context::{Context, HistoryEntry};
pub use error::StepError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use loops::{LoopSource, LoopStep};
pub use registry::{Services, StepBuilder, StepRegistry};
pub use result::{StepResult, StepStatus};
pub use step::{Step, StepStream};
pub use template_step::TemplateStep;
