//! Caller-side owner of execution sessions.
//!
//! One bridge owns at most one live session. Starting a run tears the
//! previous one down; events flow out of a single receiver, tagged by
//! session id. Stdin travels through the shared mailbox; termination is
//! abrupt (epoch interrupt plus a channel wake for a blocked read).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use wasmtime::Engine;

use crate::host::ExecutionHost;
use crate::stdin::{StdinChannel, StdinWrite};
use crate::{RuntimeEvent, SessionId};

struct ExecutionSession {
    id: SessionId,
    engine: Engine,
    channel: Arc<StdinChannel>,
    detached: Arc<AtomicBool>,
    join: thread::JoinHandle<()>,
}

pub struct RuntimeBridge {
    tx: mpsc::Sender<RuntimeEvent>,
    session: Option<ExecutionSession>,
    next_session: u64,
    stdin_enabled: bool,
}

impl RuntimeBridge {
    /// Bridge with interactive stdin. Returns the event receiver the
    /// caller drains; a session's last event is Exit or RuntimeError.
    pub fn new() -> (Self, mpsc::Receiver<RuntimeEvent>) {
        Self::build(true)
    }

    /// Bridge whose sessions see immediate EOF on stdin. The fallback for
    /// environments that cannot provide the blocking mailbox.
    pub fn with_stdin_disabled() -> (Self, mpsc::Receiver<RuntimeEvent>) {
        Self::build(false)
    }

    fn build(stdin_enabled: bool) -> (Self, mpsc::Receiver<RuntimeEvent>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                tx,
                session: None,
                next_session: 1,
                stdin_enabled,
            },
            rx,
        )
    }

    /// Terminates any prior session, allocates a fresh stdin channel and
    /// spawns a new execution host for `binary`.
    pub fn run(&mut self, binary: Vec<u8>) -> Result<SessionId> {
        self.terminate();

        let id = SessionId(self.next_session);
        self.next_session += 1;

        let channel = Arc::new(if self.stdin_enabled {
            StdinChannel::new()
        } else {
            StdinChannel::closed()
        });
        let detached = Arc::new(AtomicBool::new(false));

        let host = ExecutionHost::new(id)?;
        let engine = host.engine().clone();

        let join = {
            let channel = channel.clone();
            let detached = detached.clone();
            let tx = self.tx.clone();
            thread::Builder::new()
                .name(format!("wasmpad-host-{}", id.0))
                .spawn(move || host.execute(binary, channel, tx, detached))
                .context("spawn execution host thread")?
        };

        self.session = Some(ExecutionSession {
            id,
            engine,
            channel,
            detached,
            join,
        });
        Ok(id)
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Encodes `text` into the stdin slot and wakes the guest. `None` when
    /// no session is live or the channel is already at EOF; otherwise the
    /// receipt reports how much was written and how much was truncated.
    pub fn send_stdin(&self, text: &str) -> Option<StdinWrite> {
        let session = self.session.as_ref()?;
        session.channel.send(text.as_bytes())
    }

    pub fn send_eof(&self) {
        if let Some(session) = &self.session {
            session.channel.send_eof();
        }
    }

    /// The raw channel of the live session, for producers that stream
    /// input in slot-sized chunks.
    pub fn stdin_channel(&self) -> Option<Arc<StdinChannel>> {
        self.session.as_ref().map(|s| s.channel.clone())
    }

    /// Blocks until the live session's host thread finishes naturally.
    pub fn wait_finished(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.join.join();
        }
    }

    /// Abrupt teardown: detach the event sink, interrupt running code via
    /// the engine epoch, wake any blocked stdin read, then reap the
    /// thread.
    pub fn terminate(&mut self) {
        if let Some(session) = self.session.take() {
            session.detached.store(true, Ordering::Release);
            session.engine.increment_epoch();
            session.channel.send_eof();
            let _ = session.join.join();
        }
    }
}

impl Drop for RuntimeBridge {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Feeds `input` to the session in slot-sized chunks, waiting for the
/// guest to drain each one, then signals EOF. Gives up on a chunk if the
/// guest stops reading.
pub fn feed_stdin(channel: &StdinChannel, input: &[u8], chunk_timeout: Duration) {
    for chunk in input.chunks(wasmpad_contracts::STDIN_CAPACITY) {
        if channel.send(chunk).is_none() {
            return;
        }
        if !channel.wait_drained(chunk_timeout) {
            break;
        }
    }
    channel.send_eof();
}
