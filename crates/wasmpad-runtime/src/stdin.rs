//! Single-slot blocking stdin mailbox.
//!
//! The producer (runtime bridge) and the consumer (syscall layer, running
//! on the execution host thread) share one slot guarded by a signal word:
//! EMPTY -> DATA -> EMPTY for each handoff, EMPTY -> EOF exactly once.
//! EOF is terminal; the channel accepts no data afterwards.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use wasmpad_contracts::{
    STDIN_CAPACITY, STDIN_SIGNAL_DATA, STDIN_SIGNAL_EMPTY, STDIN_SIGNAL_EOF,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Empty,
    Data,
    Eof,
}

impl Signal {
    pub fn as_i32(self) -> i32 {
        match self {
            Signal::Empty => STDIN_SIGNAL_EMPTY,
            Signal::Data => STDIN_SIGNAL_DATA,
            Signal::Eof => STDIN_SIGNAL_EOF,
        }
    }
}

/// Receipt for one producer write. Oversized writes are truncated to the
/// slot capacity; the dropped byte count is reported rather than lost
/// silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdinWrite {
    pub written: usize,
    pub truncated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    Data(Vec<u8>),
    Eof,
}

struct Slot {
    signal: Signal,
    length: usize,
    payload: Box<[u8; STDIN_CAPACITY]>,
}

pub struct StdinChannel {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl StdinChannel {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                signal: Signal::Empty,
                length: 0,
                payload: Box::new([0; STDIN_CAPACITY]),
            }),
            cond: Condvar::new(),
        }
    }

    /// A channel that is already at EOF. Used when interactive stdin is
    /// unavailable or disabled: every read reports end-of-input without
    /// blocking.
    pub fn closed() -> Self {
        let ch = Self::new();
        ch.send_eof();
        ch
    }

    /// Producer side: copy `bytes` into the slot (truncating to capacity),
    /// mark it DATA and wake the consumer. Overwrites an unconsumed DATA
    /// slot. Returns `None` once EOF has been signaled.
    pub fn send(&self, bytes: &[u8]) -> Option<StdinWrite> {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.signal == Signal::Eof {
            return None;
        }
        let written = bytes.len().min(STDIN_CAPACITY);
        slot.payload[..written].copy_from_slice(&bytes[..written]);
        slot.length = written;
        slot.signal = Signal::Data;
        // Both the consumer and a draining producer wait on this condvar;
        // wake everyone and let the predicates sort it out.
        self.cond.notify_all();
        Some(StdinWrite {
            written,
            truncated: bytes.len() - written,
        })
    }

    /// Producer side: signal end-of-input. One-way; DATA still in the slot
    /// is discarded.
    pub fn send_eof(&self) {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.signal = Signal::Eof;
        slot.length = 0;
        self.cond.notify_all();
    }

    /// Consumer side: block until the slot holds data or EOF. On DATA,
    /// take up to `max` bytes, reset the slot to EMPTY and wake the
    /// producer; payload beyond `max` is dropped with the slot.
    pub fn recv(&self, max: usize) -> RecvOutcome {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            match slot.signal {
                Signal::Eof => return RecvOutcome::Eof,
                Signal::Data => {
                    let take = slot.length.min(max);
                    let bytes = slot.payload[..take].to_vec();
                    slot.signal = Signal::Empty;
                    slot.length = 0;
                    self.cond.notify_all();
                    return RecvOutcome::Data(bytes);
                }
                Signal::Empty => {
                    slot = match self.cond.wait(slot) {
                        Ok(slot) => slot,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
    }

    /// Producer side: wait until the consumer drained the slot (or EOF).
    /// Returns false if still occupied when the timeout elapses. Lets a
    /// producer stream input larger than one slot without overwriting.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (slot, result) = match self
            .cond
            .wait_timeout_while(slot, timeout, |s| s.signal == Signal::Data)
        {
            Ok((slot, result)) => (slot, result),
            Err(poisoned) => {
                let (slot, result) = poisoned.into_inner();
                (slot, result)
            }
        };
        drop(slot);
        !result.timed_out()
    }

    /// Current signal state, for protocol assertions.
    pub fn signal(&self) -> Signal {
        match self.slot.lock() {
            Ok(slot) => slot.signal,
            Err(poisoned) => poisoned.into_inner().signal,
        }
    }
}

impl Default for StdinChannel {
    fn default() -> Self {
        Self::new()
    }
}
