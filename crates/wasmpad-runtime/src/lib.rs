//! Sandboxed execution engine: a wasm32-wasi guest runs on an isolated
//! thread behind an emulated syscall surface, with a single-slot blocking
//! stdin mailbox between the caller and the guest.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod bridge;
pub mod host;
pub mod stdin;
pub mod wasi;

pub use bridge::{feed_stdin, RuntimeBridge};
pub use host::ExecutionHost;
pub use stdin::{RecvOutcome, StdinChannel, StdinWrite};

/// Identifies one execution session. Monotonic per bridge; events from a
/// terminated session keep their id so stale output can be filtered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Everything a session reports back to its owner. Ordering is preserved
/// within the stdout stream and within the stderr stream; no ordering is
/// guaranteed between the two streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum RuntimeEvent {
    Stdout { session: SessionId, text: String },
    Stderr { session: SessionId, text: String },
    Exit { session: SessionId, code: i32 },
    RuntimeError { session: SessionId, message: String },
}

impl RuntimeEvent {
    pub fn session(&self) -> SessionId {
        match self {
            RuntimeEvent::Stdout { session, .. }
            | RuntimeEvent::Stderr { session, .. }
            | RuntimeEvent::Exit { session, .. }
            | RuntimeEvent::RuntimeError { session, .. } => *session,
        }
    }

    /// Exit and runtime-error are terminal; a session emits exactly one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuntimeEvent::Exit { .. } | RuntimeEvent::RuntimeError { .. }
        )
    }
}
