//! WASI snapshot_preview1 emulation.
//!
//! Every operation here is a pure function over a linear-memory slice, the
//! per-instance [`WasiState`] and an [`OutputSink`]. The execution host
//! wires them to wasmtime imports; tests drive them against plain byte
//! buffers. Errno values are returned, never panics: the only control-flow
//! exception is [`ProgramExit`], the typed value `proc_exit` unwinds with.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::stdin::{RecvOutcome, StdinChannel};

pub const ERRNO_SUCCESS: i32 = 0;
pub const ERRNO_BADF: i32 = 8;
pub const ERRNO_FAULT: i32 = 21;
pub const ERRNO_IO: i32 = 29;
pub const ERRNO_NOSYS: i32 = 52;

pub const FD_STDIN: i32 = 0;
pub const FD_STDOUT: i32 = 1;
pub const FD_STDERR: i32 = 2;

/// Raised by `proc_exit`: normal guest termination, not a fault. The host
/// downcasts for it and treats it as success (the exit event has already
/// been delivered through the sink).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramExit(pub i32);

impl fmt::Display for ProgramExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc_exit({})", self.0)
    }
}

impl std::error::Error for ProgramExit {}

/// Where decoded guest output and the exit report go.
pub trait OutputSink {
    fn stdout(&mut self, text: &str);
    fn stderr(&mut self, text: &str);
    fn exit(&mut self, code: i32);
}

/// Incremental UTF-8 decoder. Carries incomplete trailing sequences to the
/// next call so multi-byte characters split across iovecs (or across
/// separate fd_write calls) decode intact. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn decode(&mut self, bytes: &[u8], out: &mut String) {
        if self.pending.is_empty() {
            self.consume(bytes, out);
        } else {
            let mut carry = std::mem::take(&mut self.pending);
            carry.extend_from_slice(bytes);
            self.consume(&carry, out);
        }
    }

    fn consume(&mut self, mut input: &[u8], out: &mut String) {
        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&input[..valid]) {
                        out.push_str(text);
                    }
                    match err.error_len() {
                        Some(bad) => {
                            out.push('\u{FFFD}');
                            input = &input[valid + bad..];
                        }
                        None => {
                            // Incomplete sequence at the end of the chunk.
                            self.pending = input[valid..].to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Per-instance syscall state: the stdin mailbox plus one decoder per
/// output stream.
pub struct WasiState {
    stdin: Arc<StdinChannel>,
    stdout: Utf8Stream,
    stderr: Utf8Stream,
}

impl WasiState {
    pub fn new(stdin: Arc<StdinChannel>) -> Self {
        Self {
            stdin,
            stdout: Utf8Stream::default(),
            stderr: Utf8Stream::default(),
        }
    }
}

/// One (ptr, len) scatter/gather segment as laid out in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iovec {
    pub ptr: u32,
    pub len: u32,
}

fn guest_slice(mem: &[u8], ptr: u32, len: u32) -> Option<&[u8]> {
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    mem.get(start..end)
}

fn guest_slice_mut(mem: &mut [u8], ptr: u32, len: u32) -> Option<&mut [u8]> {
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    mem.get_mut(start..end)
}

fn write_u32(mem: &mut [u8], ptr: u32, value: u32) -> Option<()> {
    guest_slice_mut(mem, ptr, 4)?.copy_from_slice(&value.to_le_bytes());
    Some(())
}

fn write_u64(mem: &mut [u8], ptr: u32, value: u64) -> Option<()> {
    guest_slice_mut(mem, ptr, 8)?.copy_from_slice(&value.to_le_bytes());
    Some(())
}

fn read_iovecs(mem: &[u8], iovs_ptr: u32, iovs_len: u32) -> Option<Vec<Iovec>> {
    let mut iovs = Vec::with_capacity(iovs_len as usize);
    for i in 0..iovs_len {
        let base = iovs_ptr.checked_add(i.checked_mul(8)?)?;
        let raw = guest_slice(mem, base, 8)?;
        iovs.push(Iovec {
            ptr: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            len: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        });
    }
    Some(iovs)
}

/// fds 1/2 only. Each iovec is decoded as streaming UTF-8 and routed to
/// the matching sink stream.
pub fn fd_write(
    mem: &mut [u8],
    state: &mut WasiState,
    sink: &mut dyn OutputSink,
    fd: i32,
    iovs_ptr: u32,
    iovs_len: u32,
    nwritten_ptr: u32,
) -> i32 {
    if fd != FD_STDOUT && fd != FD_STDERR {
        return ERRNO_BADF;
    }
    let Some(iovs) = read_iovecs(mem, iovs_ptr, iovs_len) else {
        return ERRNO_FAULT;
    };
    let mut text = String::new();
    let mut total: u32 = 0;
    for iov in &iovs {
        let Some(bytes) = guest_slice(mem, iov.ptr, iov.len) else {
            return ERRNO_FAULT;
        };
        let stream = if fd == FD_STDOUT {
            &mut state.stdout
        } else {
            &mut state.stderr
        };
        stream.decode(bytes, &mut text);
        total = total.saturating_add(iov.len);
    }
    if !text.is_empty() {
        if fd == FD_STDOUT {
            sink.stdout(&text);
        } else {
            sink.stderr(&text);
        }
    }
    if write_u32(mem, nwritten_ptr, total).is_none() {
        return ERRNO_FAULT;
    }
    ERRNO_SUCCESS
}

/// fd 0 only. Blocks on the stdin mailbox. EOF reads zero bytes and never
/// blocks again; DATA is scattered into the iovecs up to their combined
/// capacity and the slot is handed back to the producer.
pub fn fd_read(
    mem: &mut [u8],
    state: &mut WasiState,
    fd: i32,
    iovs_ptr: u32,
    iovs_len: u32,
    nread_ptr: u32,
) -> i32 {
    if fd != FD_STDIN {
        return ERRNO_BADF;
    }
    let Some(iovs) = read_iovecs(mem, iovs_ptr, iovs_len) else {
        return ERRNO_FAULT;
    };
    let capacity: usize = iovs.iter().map(|iov| iov.len as usize).sum();
    let bytes = match state.stdin.recv(capacity) {
        RecvOutcome::Eof => Vec::new(),
        RecvOutcome::Data(bytes) => bytes,
    };
    let mut offset = 0;
    for iov in &iovs {
        if offset >= bytes.len() {
            break;
        }
        let take = (iov.len as usize).min(bytes.len() - offset);
        let Some(dst) = guest_slice_mut(mem, iov.ptr, take as u32) else {
            return ERRNO_FAULT;
        };
        dst.copy_from_slice(&bytes[offset..offset + take]);
        offset += take;
    }
    if write_u32(mem, nread_ptr, offset as u32).is_none() {
        return ERRNO_FAULT;
    }
    ERRNO_SUCCESS
}

/// Reports the exit through the sink, then hands back the control value
/// the host unwinds with. Always succeeds, whatever the code.
pub fn proc_exit(sink: &mut dyn OutputSink, code: i32) -> ProgramExit {
    sink.exit(code);
    ProgramExit(code)
}

/// The sandbox passes no arguments.
pub fn args_sizes_get(mem: &mut [u8], argc_ptr: u32, argv_buf_size_ptr: u32) -> i32 {
    if write_u32(mem, argc_ptr, 0).is_none() || write_u32(mem, argv_buf_size_ptr, 0).is_none() {
        return ERRNO_FAULT;
    }
    ERRNO_SUCCESS
}

pub fn args_get(_argv_ptr: u32, _argv_buf_ptr: u32) -> i32 {
    ERRNO_SUCCESS
}

/// The sandbox exposes no environment.
pub fn environ_sizes_get(mem: &mut [u8], count_ptr: u32, buf_size_ptr: u32) -> i32 {
    if write_u32(mem, count_ptr, 0).is_none() || write_u32(mem, buf_size_ptr, 0).is_none() {
        return ERRNO_FAULT;
    }
    ERRNO_SUCCESS
}

pub fn environ_get(_environ_ptr: u32, _environ_buf_ptr: u32) -> i32 {
    ERRNO_SUCCESS
}

/// Wall-clock nanoseconds for every clock id.
pub fn clock_time_get(mem: &mut [u8], time_ptr: u32) -> i32 {
    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed,
        Err(_) => return ERRNO_IO,
    };
    match write_u64(mem, time_ptr, now.as_nanos() as u64) {
        Some(()) => ERRNO_SUCCESS,
        None => ERRNO_FAULT,
    }
}

/// Cryptographically strong bytes straight into guest memory.
pub fn random_get(mem: &mut [u8], buf_ptr: u32, buf_len: u32) -> i32 {
    let Some(buf) = guest_slice_mut(mem, buf_ptr, buf_len) else {
        return ERRNO_FAULT;
    };
    if getrandom::getrandom(buf).is_err() {
        return ERRNO_IO;
    }
    ERRNO_SUCCESS
}

/// Minimal fdstat for the three standard streams: character device,
/// no flags, no rights.
pub fn fd_fdstat_get(mem: &mut [u8], fd: i32, buf_ptr: u32) -> i32 {
    if !(FD_STDIN..=FD_STDERR).contains(&fd) {
        return ERRNO_BADF;
    }
    let Some(buf) = guest_slice_mut(mem, buf_ptr, 24) else {
        return ERRNO_FAULT;
    };
    buf.fill(0);
    buf[0] = 2; // filetype character_device
    ERRNO_SUCCESS
}

pub fn fd_close(fd: i32) -> i32 {
    if (FD_STDIN..=FD_STDERR).contains(&fd) {
        ERRNO_SUCCESS
    } else {
        ERRNO_BADF
    }
}

/// No preopened directories exist in the sandbox.
pub fn fd_prestat_get(_fd: i32, _buf_ptr: u32) -> i32 {
    ERRNO_BADF
}

pub fn fd_prestat_dir_name(_fd: i32, _path_ptr: u32, _path_len: u32) -> i32 {
    ERRNO_BADF
}
