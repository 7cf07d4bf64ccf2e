//! Supervisor resilience tests driven by scripted toolchain drivers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use wasmpad_compiler::supervisor::{CompileSupervisor, SubmitError, SupervisorConfig};
use wasmpad_compiler::toolchain::{KillHandle, ToolchainDriver};
use wasmpad_compiler::{CompileOutcome, CompileStatus, FailureKind, ProgressUpdate};

fn config(timeout: Duration) -> SupervisorConfig {
    SupervisorConfig {
        compile_timeout: timeout,
    }
}

fn no_progress() -> impl FnMut(ProgressUpdate) {
    |_update| {}
}

/// Driver whose behavior per compile call is scripted up front.
enum Step {
    Succeed,
    Fail,
    Panic,
    Sleep(Duration),
}

struct ScriptedDriver {
    steps: std::vec::IntoIter<Step>,
}

impl ScriptedDriver {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into_iter(),
        }
    }
}

impl ToolchainDriver for ScriptedDriver {
    fn prepare(&mut self, progress: &mut dyn FnMut(ProgressUpdate)) -> Result<()> {
        progress(ProgressUpdate {
            stage: "ready".to_string(),
            fraction: 1.0,
            detail: None,
        });
        Ok(())
    }

    fn compile(
        &mut self,
        _source: &str,
        progress: &mut dyn FnMut(ProgressUpdate),
    ) -> CompileOutcome {
        progress(ProgressUpdate {
            stage: "compile".to_string(),
            fraction: 0.5,
            detail: None,
        });
        match self.steps.next() {
            Some(Step::Succeed) | None => CompileOutcome::succeeded(
                b"\x00asm\x01\x00\x00\x00".to_vec(),
                Vec::new(),
                String::new(),
                String::new(),
            ),
            Some(Step::Fail) => CompileOutcome::synthetic(
                FailureKind::CompileFailure,
                "scripted compile failure",
            ),
            Some(Step::Panic) => panic!("scripted worker crash"),
            Some(Step::Sleep(d)) => {
                std::thread::sleep(d);
                CompileOutcome::synthetic(FailureKind::CompileFailure, "slept past deadline")
            }
        }
    }
}

fn scripted_supervisor(
    timeout: Duration,
    mut scripts: Vec<Vec<Step>>,
) -> (CompileSupervisor, Arc<AtomicUsize>) {
    // Each worker generation consumes the next script.
    scripts.reverse();
    let spawned = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&spawned);
    let supervisor = CompileSupervisor::with_driver_factory(
        config(timeout),
        Box::new(move |_kill: KillHandle| {
            counter.fetch_add(1, Ordering::SeqCst);
            let steps = scripts.pop().unwrap_or_default();
            Box::new(ScriptedDriver::new(steps)) as Box<dyn ToolchainDriver>
        }),
    );
    (supervisor, spawned)
}

#[test]
fn successful_compile_reports_ready_with_binary() {
    let (mut supervisor, _spawned) =
        scripted_supervisor(Duration::from_secs(5), vec![vec![Step::Succeed]]);
    let mut stages = Vec::new();
    supervisor.submit("int main() {}").expect("submit");
    let result = supervisor
        .wait(&mut |update| stages.push(update.stage))
        .expect("wait");
    assert_eq!(result.status, CompileStatus::Ready);
    assert!(result.outcome.wasm.is_some());
    assert!(stages.contains(&"compile".to_string()));
    assert!(supervisor.active_task().is_none());
}

#[test]
fn submit_while_pending_is_busy_and_leaves_the_task_intact() {
    let (mut supervisor, _spawned) = scripted_supervisor(
        Duration::from_secs(5),
        vec![vec![Step::Sleep(Duration::from_millis(200)), Step::Succeed]],
    );
    let first = supervisor.submit("int main() {}").expect("submit");

    match supervisor.submit("int main() { return 1; }") {
        Err(SubmitError::Busy { active }) => assert_eq!(active, first),
        other => panic!("expected Busy, got {other:?}"),
    }

    // The rejected submit must not have disturbed the pending task.
    let result = supervisor.wait(&mut no_progress()).expect("wait");
    assert_eq!(result.task, first);
    assert_eq!(result.status, CompileStatus::Error);
    assert_eq!(result.outcome.failure, Some(FailureKind::CompileFailure));
}

#[test]
fn worker_crash_yields_synthetic_diagnostic_and_a_fresh_worker() {
    let (mut supervisor, spawned) = scripted_supervisor(
        Duration::from_secs(5),
        vec![vec![Step::Panic], vec![Step::Succeed]],
    );

    supervisor.submit("int main() {}").expect("submit");
    let crashed = supervisor.wait(&mut no_progress()).expect("wait");
    assert_eq!(crashed.status, CompileStatus::Error);
    assert_eq!(crashed.outcome.failure, Some(FailureKind::WorkerCrash));
    assert_eq!(crashed.outcome.diagnostics.len(), 1);
    assert!(crashed.outcome.diagnostics[0].is_error());

    // The next compile runs on a second worker generation and is
    // unaffected by the crash.
    supervisor.submit("int main() {}").expect("resubmit");
    let ok = supervisor.wait(&mut no_progress()).expect("wait");
    assert_eq!(ok.status, CompileStatus::Ready);
    assert_eq!(spawned.load(Ordering::SeqCst), 2);
}

#[test]
fn deadline_expiry_yields_timeout_and_accepts_new_work() {
    let (mut supervisor, spawned) = scripted_supervisor(
        Duration::from_millis(100),
        vec![vec![Step::Sleep(Duration::from_secs(30))], vec![Step::Succeed]],
    );

    supervisor.submit("int main() { for (;;); }").expect("submit");
    let timed_out = supervisor.wait(&mut no_progress()).expect("wait");
    assert_eq!(timed_out.status, CompileStatus::Error);
    assert_eq!(timed_out.outcome.failure, Some(FailureKind::Timeout));
    assert_eq!(timed_out.outcome.diagnostics.len(), 1);

    // Supervisor accepts the next task immediately; the abandoned
    // worker never blocks it.
    supervisor.submit("int main() {}").expect("resubmit");
    let ok = supervisor.wait(&mut no_progress()).expect("wait");
    assert_eq!(ok.status, CompileStatus::Ready);
    assert_eq!(spawned.load(Ordering::SeqCst), 2);
}

#[test]
fn failed_compile_reports_error_without_discarding_the_worker() {
    let (mut supervisor, spawned) = scripted_supervisor(
        Duration::from_secs(5),
        vec![vec![Step::Fail, Step::Succeed]],
    );

    supervisor.submit("int main() { broken").expect("submit");
    let failed = supervisor.wait(&mut no_progress()).expect("wait");
    assert_eq!(failed.status, CompileStatus::Error);
    assert_eq!(failed.outcome.failure, Some(FailureKind::CompileFailure));

    supervisor.submit("int main() {}").expect("resubmit");
    let ok = supervisor.wait(&mut no_progress()).expect("wait");
    assert_eq!(ok.status, CompileStatus::Ready);
    // Ordinary failures reuse the same worker.
    assert_eq!(spawned.load(Ordering::SeqCst), 1);
}

#[test]
fn warm_up_prepares_the_worker_ahead_of_the_first_compile() {
    let (mut supervisor, spawned) =
        scripted_supervisor(Duration::from_secs(5), vec![vec![Step::Succeed]]);
    let mut stages = Vec::new();
    supervisor
        .warm_up(&mut |update| stages.push(update.stage))
        .expect("warm up");
    assert_eq!(spawned.load(Ordering::SeqCst), 1);
    assert_eq!(stages, vec!["ready".to_string()]);

    supervisor.submit("int main() {}").expect("submit");
    let ok = supervisor.wait(&mut no_progress()).expect("wait");
    assert_eq!(ok.status, CompileStatus::Ready);
    assert_eq!(spawned.load(Ordering::SeqCst), 1);
}
