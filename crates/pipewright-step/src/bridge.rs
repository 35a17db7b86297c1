//! Blocking entry for async-native steps.
//!
//! `Step::execute` is synchronous. Steps whose work is naturally async drive
//! their future on a shared background runtime and wait for the result, which
//! works whether or not the caller is itself inside a runtime.

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tokio::runtime::Runtime;
use tracing::error;

use crate::error::StepError;
use crate::result::StepResult;

static RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
  tokio::runtime::Builder::new_multi_thread()
    .thread_name("pipewright-step")
    .enable_all()
    .build()
    .map_err(|e| error!(error = %e, "step_runtime_failed"))
    .ok()
});

/// Run `future` to completion on the background runtime.
pub(crate) fn block_on(future: BoxFuture<'static, StepResult>) -> StepResult {
  let Some(runtime) = RUNTIME.as_ref() else {
    return StepError::execution("background runtime unavailable").into();
  };

  let (tx, rx) = std::sync::mpsc::channel();
  runtime.spawn(async move {
    let _ = tx.send(future.await);
  });
  rx.recv()
    .unwrap_or_else(|_| StepError::execution("step task ended without a result").into())
}
