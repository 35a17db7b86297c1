//! LLM completion step over an external service.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use pipewright_config::{CompletionDef, ResponseFormat};
use pipewright_template::TemplateResolver;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::bridge;
use crate::error::StepError;
use crate::result::StepResult;
use crate::step::{Step, require_object};

/// A rendered completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
  pub model: Option<String>,
  pub messages: Vec<CompletionMessage>,
  pub temperature: Option<f32>,
  pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
  pub role: String,
  pub content: String,
}

#[derive(Debug, thiserror::Error)]
#[error("completion failed: {message}")]
pub struct CompletionError {
  pub message: String,
}

/// An LLM completion backend.
#[async_trait]
pub trait CompletionService: Send + Sync {
  /// Return the completion text for `request`.
  async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError>;
}

/// Renders its messages against the input and asks the service for a
/// completion. JSON responses are parsed into structured data.
#[derive(Clone)]
pub struct CompletionStep {
  name: Option<String>,
  def: CompletionDef,
  service: Arc<dyn CompletionService>,
  resolver: TemplateResolver,
}

impl CompletionStep {
  pub fn new(name: Option<String>, def: CompletionDef, service: Arc<dyn CompletionService>) -> Self {
    Self {
      name,
      def,
      service,
      resolver: TemplateResolver::new(),
    }
  }

  fn request(&self, input: &serde_json::Value) -> CompletionRequest {
    CompletionRequest {
      model: self.def.model.clone(),
      messages: self
        .def
        .messages
        .iter()
        .map(|m| CompletionMessage {
          role: m.role.clone(),
          content: self.resolver.render_str(&m.content, input),
        })
        .collect(),
      temperature: self.def.temperature,
      response_format: self.def.response_format,
    }
  }

  #[instrument(name = "completion_step", skip(self, input), fields(step = ?self.name))]
  async fn run(&self, input: serde_json::Value) -> StepResult {
    if let Err(e) = require_object(&input) {
      return e.into();
    }
    if self.def.messages.is_empty() {
      return StepError::configuration(
        self.name.as_deref().unwrap_or("completion"),
        "at least one message is required",
      )
      .into();
    }

    let request = self.request(&input);
    let text = match self.service.complete(request).await {
      Ok(text) => text,
      Err(e) => {
        warn!(error = %e, "completion_failed");
        return StepError::execution(e.to_string()).into();
      }
    };

    match self.def.response_format {
      ResponseFormat::Text => StepResult::success(text),
      ResponseFormat::Json => match serde_json::from_str::<serde_json::Value>(strip_fence(&text)) {
        Ok(value) => StepResult::success(value),
        Err(e) => StepResult::from(StepError::execution(format!(
          "completion response is not valid JSON: {}",
          e
        )))
        .with_metadata("raw_response", text),
      },
    }
  }
}

/// Strip a surrounding markdown code fence, if any.
fn strip_fence(text: &str) -> &str {
  let trimmed = text.trim();
  let Some(body) = trimmed.strip_prefix("```") else {
    return trimmed;
  };
  let body = body.strip_suffix("```").unwrap_or(body);
  match body.split_once('\n') {
    Some((lang, rest)) if !lang.trim().contains(' ') => rest.trim(),
    _ => body.trim(),
  }
}

impl Step for CompletionStep {
  fn kind(&self) -> &'static str {
    "completion"
  }

  fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  fn execute(&self, input: &serde_json::Value) -> StepResult {
    bridge::block_on(Arc::new(self.clone()).execute_async(input.clone()))
  }

  fn execute_async(self: Arc<Self>, input: serde_json::Value) -> BoxFuture<'static, StepResult> {
    Box::pin(async move { self.run(input).await })
  }
}
