//! Templated configuration values.
//!
//! Any string inside a step definition may contain minijinja expressions that
//! are resolved against the execution context when the step runs.
//!
//! # Examples
//!
//! ```json
//! {
//!   "type": "template",
//!   "name": "greeting",
//!   "output": {
//!     "text": "Hello {{ user.name | title }}!",
//!     "items": "{{ search_results }}",
//!     "static_value": 42
//!   }
//! }
//! ```
//!
//! A string that consists of exactly one expression (`"{{ search_results }}"`)
//! resolves to the typed value it references; mixed text resolves to a string.

/// A JSON value whose string leaves are templates.
pub type TemplateValue = serde_json::Value;
