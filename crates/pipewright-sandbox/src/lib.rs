//! Pipewright Sandbox
//!
//! Runs user-supplied code for pipeline steps. Two backends are provided:
//!
//! - [`LocalSandbox`]: an in-process Lua 5.4 interpreter restricted by a
//!   [`CapabilityPolicy`]. Source is statically scanned before anything runs.
//!   This is best-effort capability restriction, not a security boundary.
//! - [`RemoteSandbox`]: session-addressable isolated execution. Sessions are
//!   looked up (or created) by a caller-supplied id through a
//!   [`SessionProvider`] and keep their state across calls. Python globals
//!   left behind by a run are recovered through the export protocol in
//!   [`export`].
//!
//! ```text
//! RemoteSandbox
//! ├── run(session_id, code, context)           - shell or python mode
//! ├── run_streaming(session_id, code, context, on_output)
//! └── evaluate_condition(session_id, expr, context)
//!
//! SessionProvider (ProcessSessionProvider)
//! └── Session (one python worker process per session id)
//! ```

mod error;
pub mod export;
mod local;
mod policy;
mod remote;
mod scan;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{ExportDecodeError, SandboxError};
pub use local::{LocalOutput, LocalSandbox};
pub use policy::CapabilityPolicy;
pub use remote::{
  CONDITION_TIMEOUT, CodeFailure, CodeOutput, CommandOutput, DEFAULT_CALL_TIMEOUT,
  DEFAULT_SESSION_TIMEOUT, OutputEvent, OutputSink, OutputStream, ProcessProviderConfig,
  ProcessSessionProvider, RemoteRun, RemoteSandbox, ResolvedSession, Session, SessionProvider,
  is_shell_payload,
};
pub use scan::{ScanFinding, scan};
