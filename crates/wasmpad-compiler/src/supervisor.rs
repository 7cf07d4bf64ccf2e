//! Compile supervisor: owns the worker thread, enforces single-flight
//! dispatch and a wall-clock deadline, and survives worker crashes.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::toolchain::{ClangToolchain, KillHandle, ToolchainDriver};
use crate::{CompileOutcome, CompileStatus, FailureKind, ProgressUpdate, TaskId};

/// Builds a fresh driver for each worker. The kill handle is shared
/// with the supervisor so a hung toolchain process can be killed from
/// outside the worker.
pub type DriverFactory = Box<dyn FnMut(KillHandle) -> Box<dyn ToolchainDriver> + Send>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub compile_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            compile_timeout: Duration::from_secs(60),
        }
    }
}

enum WorkerRequest {
    Warmup(TaskId),
    Compile(TaskId, String),
}

enum WorkerReply {
    Progress(TaskId, ProgressUpdate),
    Warmed(TaskId, Result<(), String>),
    Finished(TaskId, CompileOutcome),
}

struct WorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
    rx: mpsc::Receiver<WorkerReply>,
    kill: KillHandle,
}

struct ActiveTask {
    id: TaskId,
    deadline: Instant,
}

#[derive(Debug)]
pub enum SubmitError {
    /// A task is already in flight; the pending task is unaffected.
    Busy { active: TaskId },
    Worker(anyhow::Error),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Busy { active } => write!(f, "compile {active} already in flight"),
            SubmitError::Worker(err) => write!(f, "compile worker unavailable: {err:#}"),
        }
    }
}

impl std::error::Error for SubmitError {}

#[derive(Debug)]
pub struct TaskResult {
    pub task: TaskId,
    pub status: CompileStatus,
    pub outcome: CompileOutcome,
}

/// Single-flight compile orchestrator. The worker thread is created
/// lazily (or eagerly via [`warm_up`](Self::warm_up)) and discarded on
/// crash or timeout; the supervisor itself stays usable across both.
pub struct CompileSupervisor {
    config: SupervisorConfig,
    factory: DriverFactory,
    worker: Option<WorkerHandle>,
    active: Option<ActiveTask>,
    next_task: u64,
}

impl CompileSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_driver_factory(
            config,
            Box::new(|kill| Box::new(ClangToolchain::new(kill)) as Box<dyn ToolchainDriver>),
        )
    }

    pub fn with_driver_factory(config: SupervisorConfig, factory: DriverFactory) -> Self {
        Self {
            config,
            factory,
            worker: None,
            active: None,
            next_task: 1,
        }
    }

    fn alloc_task(&mut self) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        id
    }

    fn ensure_worker(&mut self) -> Result<&WorkerHandle> {
        if self.worker.is_none() {
            let kill = KillHandle::new();
            let driver = (self.factory)(kill.clone());
            let (req_tx, req_rx) = mpsc::channel::<WorkerRequest>();
            let (reply_tx, reply_rx) = mpsc::channel::<WorkerReply>();
            thread::Builder::new()
                .name("wasmpad-compile-worker".to_string())
                .spawn(move || worker_loop(driver, req_rx, reply_tx))
                .map_err(|err| anyhow!("spawn compile worker: {err}"))?;
            self.worker = Some(WorkerHandle {
                tx: req_tx,
                rx: reply_rx,
                kill,
            });
        }
        match self.worker.as_ref() {
            Some(worker) => Ok(worker),
            None => Err(anyhow!("compile worker missing after creation")),
        }
    }

    /// Discards the worker without joining it. A crashed thread is
    /// already gone; a hung one is left detached with its toolchain
    /// process killed.
    fn discard_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.kill.kill_active();
        }
    }

    /// Creates the worker and runs asset preparation ahead of the
    /// first compile. Blocks until preparation finishes or the
    /// deadline passes.
    pub fn warm_up(&mut self, on_progress: &mut dyn FnMut(ProgressUpdate)) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        let task = self.alloc_task();
        let deadline = Instant::now() + self.config.compile_timeout;
        let worker = self.ensure_worker()?;
        if worker.tx.send(WorkerRequest::Warmup(task)).is_err() {
            self.discard_worker();
            return Err(anyhow!("compile worker exited before warmup"));
        }
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let worker = match self.worker.as_ref() {
                Some(w) => w,
                None => return Err(anyhow!("compile worker discarded during warmup")),
            };
            match worker.rx.recv_timeout(remaining) {
                Ok(WorkerReply::Progress(id, update)) => {
                    if id == task {
                        on_progress(update);
                    }
                }
                Ok(WorkerReply::Warmed(id, result)) if id == task => {
                    return result.map_err(|msg| anyhow!(msg));
                }
                Ok(_) => {}
                Err(mpsc::RecvTimeoutError::Timeout) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.discard_worker();
                    return Err(anyhow!("compile worker failed during warmup"));
                }
            }
        }
    }

    /// Dispatches a compile. Fails synchronously with `Busy` while a
    /// task is in flight; the in-flight task is not disturbed.
    pub fn submit(&mut self, source: &str) -> Result<TaskId, SubmitError> {
        if let Some(active) = &self.active {
            return Err(SubmitError::Busy { active: active.id });
        }
        let task = self.alloc_task();
        let request = WorkerRequest::Compile(task, source.to_string());
        let worker = self.ensure_worker().map_err(SubmitError::Worker)?;
        if let Err(mpsc::SendError(request)) = worker.tx.send(request) {
            // Worker died idle. Replace it and retry once.
            self.discard_worker();
            let worker = self.ensure_worker().map_err(SubmitError::Worker)?;
            if worker.tx.send(request).is_err() {
                self.discard_worker();
                return Err(SubmitError::Worker(anyhow!(
                    "compile worker exited before accepting work"
                )));
            }
        }
        self.active = Some(ActiveTask {
            id: task,
            deadline: Instant::now() + self.config.compile_timeout,
        });
        Ok(task)
    }

    pub fn active_task(&self) -> Option<TaskId> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Blocks until the active task resolves, relaying progress ticks.
    /// Crash and timeout resolve the task with a synthetic diagnostic
    /// and leave the supervisor ready for the next submit.
    pub fn wait(&mut self, on_progress: &mut dyn FnMut(ProgressUpdate)) -> Result<TaskResult> {
        let (task, deadline) = match &self.active {
            Some(active) => (active.id, active.deadline),
            None => return Err(anyhow!("no compile in flight")),
        };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let worker = match self.worker.as_ref() {
                Some(w) => w,
                None => return Ok(self.fail_active(task, FailureKind::WorkerCrash)),
            };
            match worker.rx.recv_timeout(remaining) {
                Ok(WorkerReply::Progress(id, update)) => {
                    if id == task {
                        on_progress(update);
                    }
                }
                Ok(WorkerReply::Finished(id, outcome)) if id == task => {
                    self.active = None;
                    let status = outcome.status();
                    return Ok(TaskResult {
                        task,
                        status,
                        outcome,
                    });
                }
                // Stale replies from a previous worker generation.
                Ok(_) => {}
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Ok(self.fail_active(task, FailureKind::Timeout));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Ok(self.fail_active(task, FailureKind::WorkerCrash));
                }
            }
        }
    }

    fn fail_active(&mut self, task: TaskId, kind: FailureKind) -> TaskResult {
        self.discard_worker();
        self.active = None;
        let message = match kind {
            FailureKind::Timeout => "compile timed out; toolchain process killed",
            _ => "compile worker crashed",
        };
        let outcome = CompileOutcome::synthetic(kind, message);
        TaskResult {
            task,
            status: CompileStatus::Error,
            outcome,
        }
    }
}

fn worker_loop(
    mut driver: Box<dyn ToolchainDriver>,
    rx: mpsc::Receiver<WorkerRequest>,
    tx: mpsc::Sender<WorkerReply>,
) {
    let mut prepared = false;

    while let Ok(request) = rx.recv() {
        match request {
            WorkerRequest::Warmup(task) => {
                let result = if prepared {
                    Ok(())
                } else {
                    let progress_tx = tx.clone();
                    let mut progress = move |update: ProgressUpdate| {
                        let _ = progress_tx.send(WorkerReply::Progress(task, update));
                    };
                    driver.prepare(&mut progress).map_err(|err| format!("{err:#}"))
                };
                prepared = prepared || result.is_ok();
                if tx.send(WorkerReply::Warmed(task, result)).is_err() {
                    return;
                }
            }
            WorkerRequest::Compile(task, source) => {
                let progress_tx = tx.clone();
                let mut progress = move |update: ProgressUpdate| {
                    let _ = progress_tx.send(WorkerReply::Progress(task, update));
                };
                if !prepared {
                    if let Err(err) = driver.prepare(&mut progress) {
                        let outcome = CompileOutcome::synthetic(
                            FailureKind::CompileFailure,
                            format!("toolchain preparation failed: {err:#}"),
                        );
                        if tx.send(WorkerReply::Finished(task, outcome)).is_err() {
                            return;
                        }
                        continue;
                    }
                    prepared = true;
                }
                let outcome = driver.compile(&source, &mut progress);
                if tx.send(WorkerReply::Finished(task, outcome)).is_err() {
                    return;
                }
            }
        }
    }
}
