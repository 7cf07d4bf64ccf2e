//! Compile-side half of wasmpad: the diagnostics model, the clang
//! toolchain driver, and the crash-isolating supervisor that owns the
//! worker thread.

pub mod diagnostics;
pub mod supervisor;
pub mod toolchain;

use serde::Serialize;

pub use diagnostics::{parse_diagnostics, Diagnostic, Severity};
pub use supervisor::{CompileSupervisor, SubmitError, SupervisorConfig, TaskResult};
pub use toolchain::{ClangToolchain, KillHandle, ToolchainDriver};

/// Monotonic per-supervisor compile task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// One progress tick relayed from the worker while a task runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub stage: String,
    /// 0.0 ..= 1.0; asset downloads report capped fractions until the
    /// readiness step confirms completion.
    pub fraction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileStatus {
    Ready,
    Error,
}

/// Why a compile produced no runnable binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    CompileFailure,
    LinkFailure,
    InvalidBinary,
    WorkerCrash,
    Timeout,
}

/// Result of one compile task, success or not. `wasm` is only present
/// on success and is never serialized into reports.
#[derive(Debug, Clone, Serialize)]
pub struct CompileOutcome {
    pub success: bool,
    #[serde(skip)]
    pub wasm: Option<Vec<u8>>,
    pub diagnostics: Vec<Diagnostic>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl CompileOutcome {
    pub fn succeeded(wasm: Vec<u8>, diagnostics: Vec<Diagnostic>, stdout: String, stderr: String) -> Self {
        Self {
            success: true,
            wasm: Some(wasm),
            diagnostics,
            stdout,
            stderr,
            failure: None,
        }
    }

    pub fn failed(
        kind: FailureKind,
        diagnostics: Vec<Diagnostic>,
        stdout: String,
        stderr: String,
    ) -> Self {
        Self {
            success: false,
            wasm: None,
            diagnostics,
            stdout,
            stderr,
            failure: Some(kind),
        }
    }

    /// Single synthetic-diagnostic outcome used for crash and timeout
    /// resolutions.
    pub fn synthetic(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::failed(kind, vec![Diagnostic::synthetic(message)], String::new(), String::new())
    }

    pub fn status(&self) -> CompileStatus {
        if self.success {
            CompileStatus::Ready
        } else {
            CompileStatus::Error
        }
    }
}
