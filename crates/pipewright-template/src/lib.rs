//! Pipewright Template
//!
//! Renders templated step configuration against the execution context at call
//! time. Resolution never fails: an expression that cannot be resolved renders
//! as its original placeholder text so pipeline authors can see which values
//! were missing.

mod error;
mod resolver;

pub use error::TemplateError;
pub use resolver::{TemplateResolver, has_expressions};
