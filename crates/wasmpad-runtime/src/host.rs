//! Execution host: one compiled binary, one isolated thread, one store.
//!
//! The host validates the magic header, compiles the module, resolves the
//! imported-vs-exported linear memory with a two-phase bind, registers the
//! syscall surface and drives `_start`. Termination is reported through
//! the event sink exactly once per session: either an exit code or a
//! runtime error, never both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use anyhow::{Context, Result};
use wasmtime::{Caller, Config, Engine, ExternType, Linker, Memory, Module, Store};

use wasmpad_contracts::{WASM_HEADER_BYTES, WASM_MAGIC};

use crate::stdin::StdinChannel;
use crate::wasi::{self, OutputSink, ProgramExit, WasiState};
use crate::{RuntimeEvent, SessionId};

const WASI_MODULE: &str = "wasi_snapshot_preview1";
const ENTRY_EXPORT: &str = "_start";
const MEMORY_EXPORT: &str = "memory";

/// Event relay for one session. Dropped sessions are detached: late
/// events from an abandoned host thread are suppressed, and the exit
/// event is delivered at most once.
pub(crate) struct EventSink {
    tx: mpsc::Sender<RuntimeEvent>,
    session: SessionId,
    detached: Arc<AtomicBool>,
    exit_sent: bool,
}

impl EventSink {
    fn send(&self, event: RuntimeEvent) {
        if !self.detached.load(Ordering::Acquire) {
            let _ = self.tx.send(event);
        }
    }

    fn runtime_error(&mut self, message: String) {
        if self.exit_sent {
            return;
        }
        self.exit_sent = true;
        let session = self.session;
        self.send(RuntimeEvent::RuntimeError { session, message });
    }
}

impl OutputSink for EventSink {
    fn stdout(&mut self, text: &str) {
        let session = self.session;
        self.send(RuntimeEvent::Stdout {
            session,
            text: text.to_string(),
        });
    }

    fn stderr(&mut self, text: &str) {
        let session = self.session;
        self.send(RuntimeEvent::Stderr {
            session,
            text: text.to_string(),
        });
    }

    fn exit(&mut self, code: i32) {
        if self.exit_sent {
            return;
        }
        self.exit_sent = true;
        let session = self.session;
        self.send(RuntimeEvent::Exit { session, code });
    }
}

/// Store data: the bound linear memory, the syscall state and the sink.
/// `memory` is rebound at most once, after instantiation, if the module
/// exports its own memory.
struct HostCtx {
    memory: Option<Memory>,
    wasi: WasiState,
    sink: EventSink,
}

pub struct ExecutionHost {
    engine: Engine,
    session: SessionId,
}

impl ExecutionHost {
    pub fn new(session: SessionId) -> Result<Self> {
        let mut config = Config::new();
        // Epoch interruption is the abrupt-termination hook: the bridge
        // bumps the epoch and running code traps at the next check point.
        config.epoch_interruption(true);
        let engine = Engine::new(&config).context("create wasm engine")?;
        Ok(Self { engine, session })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// The engine handle is the termination capability; the bridge keeps a
    /// clone and calls `increment_epoch` to interrupt a running guest.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Runs the binary to completion on the current thread. All output,
    /// the exit code or the runtime error go through `tx`; this function
    /// itself never fails.
    pub fn execute(
        self,
        binary: Vec<u8>,
        stdin: Arc<StdinChannel>,
        tx: mpsc::Sender<RuntimeEvent>,
        detached: Arc<AtomicBool>,
    ) {
        let mut sink = EventSink {
            tx,
            session: self.session,
            detached,
            exit_sent: false,
        };

        // Magic-header gate: invalid bytes are rejected before any engine
        // work is attempted.
        if binary.len() < WASM_HEADER_BYTES || binary[..4] != WASM_MAGIC {
            sink.runtime_error(
                "invalid binary: missing WebAssembly magic header".to_string(),
            );
            return;
        }

        let module = match Module::new(&self.engine, &binary) {
            Ok(module) => module,
            Err(err) => {
                sink.runtime_error(format!("invalid binary: {err:#}"));
                return;
            }
        };

        let ctx = HostCtx {
            memory: None,
            wasi: WasiState::new(stdin),
            sink,
        };
        let mut store = Store::new(&self.engine, ctx);
        store.set_epoch_deadline(1);

        if let Err(err) = run_entry(&self.engine, &module, &mut store) {
            match err.downcast_ref::<ProgramExit>() {
                // Normal termination; the exit event went out in proc_exit.
                Some(_) => {}
                None => store.data_mut().sink.runtime_error(format!("{err:#}")),
            }
        }
    }
}

fn run_entry(engine: &Engine, module: &Module, store: &mut Store<HostCtx>) -> Result<()> {
    let mut linker: Linker<HostCtx> = Linker::new(engine);
    register_wasi(&mut linker).context("register syscall imports")?;

    // Phase one: if the module wants an imported memory, inject one of the
    // declared shape and bind the syscall layer to it.
    for import in module.imports() {
        if let ExternType::Memory(memory_ty) = import.ty() {
            let memory = Memory::new(&mut *store, memory_ty)
                .context("allocate imported linear memory")?;
            linker
                .define(&mut *store, import.module(), import.name(), memory)
                .with_context(|| {
                    format!("bind imported memory {}.{}", import.module(), import.name())
                })?;
            store.data_mut().memory = Some(memory);
        }
    }

    let instance = linker
        .instantiate(&mut *store, module)
        .context("instantiate module")?;

    // Phase two: a module exporting its own memory wins; rebind before the
    // first execution step so the syscall layer observes the memory the
    // program actually touches.
    if let Some(exported) = instance.get_memory(&mut *store, MEMORY_EXPORT) {
        store.data_mut().memory = Some(exported);
    }

    let entry = instance
        .get_typed_func::<(), ()>(&mut *store, ENTRY_EXPORT)
        .with_context(|| format!("missing entry export `{ENTRY_EXPORT}`"))?;
    entry.call(&mut *store, ())?;

    // Entry returned without proc_exit: implicit success.
    store.data_mut().sink.exit(0);
    Ok(())
}

/// Borrows the bound linear memory together with the store data. Returns
/// FAULT when no memory is bound (a syscall touching memory from a module
/// that has none).
fn with_memory<R>(
    caller: &mut Caller<'_, HostCtx>,
    body: impl FnOnce(&mut [u8], &mut WasiState, &mut EventSink) -> R,
    fault: R,
) -> R {
    let Some(memory) = caller.data().memory else {
        return fault;
    };
    let (data, ctx) = memory.data_and_store_mut(caller);
    body(data, &mut ctx.wasi, &mut ctx.sink)
}

fn register_wasi(linker: &mut Linker<HostCtx>) -> Result<()> {
    linker.func_wrap(
        WASI_MODULE,
        "fd_write",
        |mut caller: Caller<'_, HostCtx>, fd: i32, iovs: i32, iovs_len: i32, nwritten: i32| {
            with_memory(
                &mut caller,
                |mem, wasi, sink| {
                    wasi::fd_write(
                        mem,
                        wasi,
                        sink,
                        fd,
                        iovs as u32,
                        iovs_len as u32,
                        nwritten as u32,
                    )
                },
                wasi::ERRNO_FAULT,
            )
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "fd_read",
        |mut caller: Caller<'_, HostCtx>, fd: i32, iovs: i32, iovs_len: i32, nread: i32| {
            with_memory(
                &mut caller,
                |mem, wasi, _sink| {
                    wasi::fd_read(mem, wasi, fd, iovs as u32, iovs_len as u32, nread as u32)
                },
                wasi::ERRNO_FAULT,
            )
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "proc_exit",
        |mut caller: Caller<'_, HostCtx>, code: i32| -> Result<()> {
            let exit = wasi::proc_exit(&mut caller.data_mut().sink, code);
            Err(anyhow::Error::new(exit))
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "args_sizes_get",
        |mut caller: Caller<'_, HostCtx>, argc: i32, argv_buf_size: i32| {
            with_memory(
                &mut caller,
                |mem, _, _| wasi::args_sizes_get(mem, argc as u32, argv_buf_size as u32),
                wasi::ERRNO_FAULT,
            )
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "args_get",
        |_caller: Caller<'_, HostCtx>, argv: i32, argv_buf: i32| {
            wasi::args_get(argv as u32, argv_buf as u32)
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "environ_sizes_get",
        |mut caller: Caller<'_, HostCtx>, count: i32, buf_size: i32| {
            with_memory(
                &mut caller,
                |mem, _, _| wasi::environ_sizes_get(mem, count as u32, buf_size as u32),
                wasi::ERRNO_FAULT,
            )
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "environ_get",
        |_caller: Caller<'_, HostCtx>, environ: i32, environ_buf: i32| {
            wasi::environ_get(environ as u32, environ_buf as u32)
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "clock_time_get",
        |mut caller: Caller<'_, HostCtx>, _clock_id: i32, _precision: i64, time: i32| {
            with_memory(
                &mut caller,
                |mem, _, _| wasi::clock_time_get(mem, time as u32),
                wasi::ERRNO_FAULT,
            )
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "random_get",
        |mut caller: Caller<'_, HostCtx>, buf: i32, buf_len: i32| {
            with_memory(
                &mut caller,
                |mem, _, _| wasi::random_get(mem, buf as u32, buf_len as u32),
                wasi::ERRNO_FAULT,
            )
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_fdstat_get",
        |mut caller: Caller<'_, HostCtx>, fd: i32, buf: i32| {
            with_memory(
                &mut caller,
                |mem, _, _| wasi::fd_fdstat_get(mem, fd, buf as u32),
                wasi::ERRNO_FAULT,
            )
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_close",
        |_caller: Caller<'_, HostCtx>, fd: i32| wasi::fd_close(fd),
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_prestat_get",
        |_caller: Caller<'_, HostCtx>, fd: i32, buf: i32| wasi::fd_prestat_get(fd, buf as u32),
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_prestat_dir_name",
        |_caller: Caller<'_, HostCtx>, fd: i32, path: i32, path_len: i32| {
            wasi::fd_prestat_dir_name(fd, path as u32, path_len as u32)
        },
    )?;

    register_nosys_stubs(linker)?;
    Ok(())
}

/// Every other preview1 import resolves but reports NotImplemented.
/// Signatures must match the real ABI or instantiation would fail for
/// modules that merely import them.
fn register_nosys_stubs(linker: &mut Linker<HostCtx>) -> Result<()> {
    const NOSYS: i32 = wasi::ERRNO_NOSYS;

    for name in ["fd_sync", "fd_datasync"] {
        linker.func_wrap(WASI_MODULE, name, |_: Caller<'_, HostCtx>, _fd: i32| NOSYS)?;
    }
    for name in ["fd_tell", "fd_filestat_get", "fd_renumber", "sock_shutdown"] {
        linker.func_wrap(
            WASI_MODULE,
            name,
            |_: Caller<'_, HostCtx>, _a: i32, _b: i32| NOSYS,
        )?;
    }
    for name in [
        "path_create_directory",
        "path_remove_directory",
        "path_unlink_file",
        "sock_accept",
    ] {
        linker.func_wrap(
            WASI_MODULE,
            name,
            |_: Caller<'_, HostCtx>, _a: i32, _b: i32, _c: i32| NOSYS,
        )?;
    }
    linker.func_wrap(
        WASI_MODULE,
        "poll_oneoff",
        |_: Caller<'_, HostCtx>, _a: i32, _b: i32, _c: i32, _d: i32| NOSYS,
    )?;
    for name in ["path_filestat_get", "path_symlink", "sock_send"] {
        linker.func_wrap(
            WASI_MODULE,
            name,
            |_: Caller<'_, HostCtx>, _a: i32, _b: i32, _c: i32, _d: i32, _e: i32| NOSYS,
        )?;
    }
    for name in ["path_readlink", "sock_recv"] {
        linker.func_wrap(
            WASI_MODULE,
            name,
            |_: Caller<'_, HostCtx>, _a: i32, _b: i32, _c: i32, _d: i32, _e: i32, _f: i32| NOSYS,
        )?;
    }
    for name in ["path_link", "path_rename"] {
        linker.func_wrap(
            WASI_MODULE,
            name,
            |_: Caller<'_, HostCtx>,
             _a: i32,
             _b: i32,
             _c: i32,
             _d: i32,
             _e: i32,
             _f: i32,
             _g: i32| NOSYS,
        )?;
    }
    linker.func_wrap(
        WASI_MODULE,
        "fd_seek",
        |_: Caller<'_, HostCtx>, _fd: i32, _offset: i64, _whence: i32, _pos: i32| NOSYS,
    )?;
    for name in ["fd_advise", "fd_filestat_set_times"] {
        linker.func_wrap(
            WASI_MODULE,
            name,
            |_: Caller<'_, HostCtx>, _a: i32, _b: i64, _c: i64, _d: i32| NOSYS,
        )?;
    }
    linker.func_wrap(
        WASI_MODULE,
        "fd_allocate",
        |_: Caller<'_, HostCtx>, _fd: i32, _offset: i64, _len: i64| NOSYS,
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_filestat_set_size",
        |_: Caller<'_, HostCtx>, _fd: i32, _size: i64| NOSYS,
    )?;
    for name in ["fd_pread", "fd_pwrite", "fd_readdir"] {
        linker.func_wrap(
            WASI_MODULE,
            name,
            |_: Caller<'_, HostCtx>, _a: i32, _b: i32, _c: i32, _d: i64, _e: i32| NOSYS,
        )?;
    }
    linker.func_wrap(
        WASI_MODULE,
        "path_filestat_set_times",
        |_: Caller<'_, HostCtx>, _a: i32, _b: i32, _c: i32, _d: i32, _e: i64, _f: i64, _g: i32| {
            NOSYS
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "path_open",
        |_: Caller<'_, HostCtx>,
         _fd: i32,
         _dirflags: i32,
         _path: i32,
         _path_len: i32,
         _oflags: i32,
         _rights_base: i64,
         _rights_inheriting: i64,
         _fdflags: i32,
         _opened: i32| NOSYS,
    )?;
    linker.func_wrap(WASI_MODULE, "sched_yield", |_: Caller<'_, HostCtx>| NOSYS)?;
    Ok(())
}
