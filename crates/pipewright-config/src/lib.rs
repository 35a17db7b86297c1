//! Pipewright Config
//!
//! This crate contains the serializable pipeline configuration types for
//! pipewright. These types describe steps before they are built into
//! executable steps by the step registry.
//!
//! Configuration can be loaded from:
//! - JSON files (via CLI with `pipewright run pipeline.json`)
//! - Any other source able to produce a `serde_json::Value`
//!
//! Field values that contain template syntax are kept as raw strings here.
//! They are resolved against the execution context at run time, never when
//! the configuration is loaded.

mod enums;
mod input;
mod pipeline;
mod step;

pub use enums::{
  ExecutionMode, ExecutionVariant, FailureMode, LoopMode, ResponseFormat, SandboxBackend,
};
pub use input::TemplateValue;
pub use pipeline::PipelineDef;
pub use step::{
  BranchCondition, BranchDef, ChainDef, CodeExecutionDef, CompletionDef, ConditionalDef,
  LoopCount, LoopDef, MessageDef, StepDef, TemplateDef,
};
