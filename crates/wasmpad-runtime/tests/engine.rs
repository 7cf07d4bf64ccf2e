//! End-to-end engine tests: guest modules are assembled with wasm-encoder
//! and run through the bridge/host pair.

use std::time::Duration;

use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, DataSection, EntityType, ExportKind, ExportSection,
    Function, FunctionSection, ImportSection, Instruction, MemArg, MemorySection, MemoryType,
    Module, TypeSection, ValType,
};

use wasmpad_runtime::{RuntimeBridge, RuntimeEvent, SessionId};

const RECV_TIMEOUT: Duration = Duration::from_secs(20);

fn memory_type() -> MemoryType {
    MemoryType {
        minimum: 1,
        maximum: None,
        memory64: false,
        shared: false,
        page_size_log2: None,
    }
}

fn mem_arg() -> MemArg {
    MemArg {
        offset: 0,
        align: 2,
        memory_index: 0,
    }
}

/// `_start` calls `proc_exit(code)`. Exports its own memory.
fn exit_module(code: i32) -> Vec<u8> {
    let mut types = TypeSection::new();
    types.ty().function([ValType::I32], []);
    types.ty().function([], []);

    let mut imports = ImportSection::new();
    imports.import("wasi_snapshot_preview1", "proc_exit", EntityType::Function(0));

    let mut functions = FunctionSection::new();
    functions.function(1);

    let mut memories = MemorySection::new();
    memories.memory(memory_type());

    let mut exports = ExportSection::new();
    exports.export("memory", ExportKind::Memory, 0);
    exports.export("_start", ExportKind::Func, 1);

    let mut body = Function::new(vec![]);
    body.instruction(&Instruction::I32Const(code));
    body.instruction(&Instruction::Call(0));
    body.instruction(&Instruction::End);
    let mut codes = CodeSection::new();
    codes.function(&body);

    let mut module = Module::new();
    module.section(&types);
    module.section(&imports);
    module.section(&functions);
    module.section(&memories);
    module.section(&exports);
    module.section(&codes);
    module.finish()
}

/// `_start` writes `text` to the given fd via one fd_write call, then
/// returns. When `import_memory` is set the module imports env.memory
/// instead of defining and exporting its own.
fn write_module(fd: i32, text: &str, import_memory: bool) -> Vec<u8> {
    let text_ptr: u32 = 16;

    let mut types = TypeSection::new();
    // fd_write(fd, iovs, iovs_len, nwritten) -> errno
    types.ty().function(
        [ValType::I32, ValType::I32, ValType::I32, ValType::I32],
        [ValType::I32],
    );
    types.ty().function([], []);

    let mut imports = ImportSection::new();
    imports.import("wasi_snapshot_preview1", "fd_write", EntityType::Function(0));
    if import_memory {
        imports.import("env", "memory", EntityType::Memory(memory_type()));
    }

    let mut functions = FunctionSection::new();
    functions.function(1);

    let mut memories = MemorySection::new();
    let mut exports = ExportSection::new();
    if !import_memory {
        memories.memory(memory_type());
        exports.export("memory", ExportKind::Memory, 0);
    }
    exports.export("_start", ExportKind::Func, 1);

    // iovec at 0 -> (text_ptr, len); nwritten at 8; text at text_ptr.
    let mut iovec = Vec::new();
    iovec.extend_from_slice(&text_ptr.to_le_bytes());
    iovec.extend_from_slice(&(text.len() as u32).to_le_bytes());
    let mut data = DataSection::new();
    data.active(0, &ConstExpr::i32_const(0), iovec);
    data.active(
        0,
        &ConstExpr::i32_const(text_ptr as i32),
        text.as_bytes().iter().copied(),
    );

    let mut body = Function::new(vec![]);
    body.instruction(&Instruction::I32Const(fd));
    body.instruction(&Instruction::I32Const(0));
    body.instruction(&Instruction::I32Const(1));
    body.instruction(&Instruction::I32Const(8));
    body.instruction(&Instruction::Call(0));
    body.instruction(&Instruction::Drop);
    body.instruction(&Instruction::End);
    let mut codes = CodeSection::new();
    codes.function(&body);

    let mut module = Module::new();
    module.section(&types);
    module.section(&imports);
    module.section(&functions);
    if !import_memory {
        module.section(&memories);
    }
    module.section(&exports);
    module.section(&codes);
    module.section(&data);
    module.finish()
}

/// `_start` reads one stdin chunk into a buffer, echoes it to stdout and
/// returns.
fn echo_module() -> Vec<u8> {
    let buf_ptr: u32 = 1024;
    let buf_len: u32 = 256;

    let mut types = TypeSection::new();
    // fd_read and fd_write share the signature.
    types.ty().function(
        [ValType::I32, ValType::I32, ValType::I32, ValType::I32],
        [ValType::I32],
    );
    types.ty().function([], []);

    let mut imports = ImportSection::new();
    imports.import("wasi_snapshot_preview1", "fd_read", EntityType::Function(0));
    imports.import("wasi_snapshot_preview1", "fd_write", EntityType::Function(0));

    let mut functions = FunctionSection::new();
    functions.function(1);

    let mut memories = MemorySection::new();
    memories.memory(memory_type());

    let mut exports = ExportSection::new();
    exports.export("memory", ExportKind::Memory, 0);
    exports.export("_start", ExportKind::Func, 2);

    // read iovec at 0 -> (buf, buf_len); nread at 8;
    // write iovec at 16 -> (buf, patched at run time); nwritten at 12.
    let mut segments = Vec::new();
    segments.extend_from_slice(&buf_ptr.to_le_bytes());
    segments.extend_from_slice(&buf_len.to_le_bytes());
    let mut write_iovec = Vec::new();
    write_iovec.extend_from_slice(&buf_ptr.to_le_bytes());
    write_iovec.extend_from_slice(&0u32.to_le_bytes());
    let mut data = DataSection::new();
    data.active(0, &ConstExpr::i32_const(0), segments);
    data.active(0, &ConstExpr::i32_const(16), write_iovec);

    let mut body = Function::new(vec![]);
    // fd_read(0, 0, 1, 8)
    body.instruction(&Instruction::I32Const(0));
    body.instruction(&Instruction::I32Const(0));
    body.instruction(&Instruction::I32Const(1));
    body.instruction(&Instruction::I32Const(8));
    body.instruction(&Instruction::Call(0));
    body.instruction(&Instruction::Drop);
    // write iovec len = nread
    body.instruction(&Instruction::I32Const(20));
    body.instruction(&Instruction::I32Const(8));
    body.instruction(&Instruction::I32Load(mem_arg()));
    body.instruction(&Instruction::I32Store(mem_arg()));
    // fd_write(1, 16, 1, 12)
    body.instruction(&Instruction::I32Const(1));
    body.instruction(&Instruction::I32Const(16));
    body.instruction(&Instruction::I32Const(1));
    body.instruction(&Instruction::I32Const(12));
    body.instruction(&Instruction::Call(1));
    body.instruction(&Instruction::Drop);
    body.instruction(&Instruction::End);
    let mut codes = CodeSection::new();
    codes.function(&body);

    let mut module = Module::new();
    module.section(&types);
    module.section(&imports);
    module.section(&functions);
    module.section(&memories);
    module.section(&exports);
    module.section(&codes);
    module.section(&data);
    module.finish()
}

/// `_start` traps with `unreachable`.
fn trap_module() -> Vec<u8> {
    let mut types = TypeSection::new();
    types.ty().function([], []);
    let mut functions = FunctionSection::new();
    functions.function(0);
    let mut exports = ExportSection::new();
    exports.export("_start", ExportKind::Func, 0);
    let mut body = Function::new(vec![]);
    body.instruction(&Instruction::Unreachable);
    body.instruction(&Instruction::End);
    let mut codes = CodeSection::new();
    codes.function(&body);

    let mut module = Module::new();
    module.section(&types);
    module.section(&functions);
    module.section(&exports);
    module.section(&codes);
    module.finish()
}

/// `_start` spins forever; only epoch interruption stops it.
fn spin_module() -> Vec<u8> {
    let mut types = TypeSection::new();
    types.ty().function([], []);
    let mut functions = FunctionSection::new();
    functions.function(0);
    let mut exports = ExportSection::new();
    exports.export("_start", ExportKind::Func, 0);
    let mut body = Function::new(vec![]);
    body.instruction(&Instruction::Loop(BlockType::Empty));
    body.instruction(&Instruction::Br(0));
    body.instruction(&Instruction::End);
    body.instruction(&Instruction::End);
    let mut codes = CodeSection::new();
    codes.function(&body);

    let mut module = Module::new();
    module.section(&types);
    module.section(&functions);
    module.section(&exports);
    module.section(&codes);
    module.finish()
}

/// Drains events for `session` until its terminal event arrives.
fn collect_session(
    rx: &std::sync::mpsc::Receiver<RuntimeEvent>,
    session: SessionId,
) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    loop {
        let event = rx.recv_timeout(RECV_TIMEOUT).expect("session event");
        if event.session() != session {
            continue;
        }
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn stdout_of(events: &[RuntimeEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::Stdout { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn proc_exit_yields_exactly_one_exit_event() {
    for code in [0, 1, 127] {
        let (mut bridge, rx) = RuntimeBridge::new();
        let session = bridge.run(exit_module(code)).expect("run");
        let events = collect_session(&rx, session);
        let exits: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, RuntimeEvent::Exit { .. }))
            .collect();
        assert_eq!(exits.len(), 1, "code {code}");
        assert!(matches!(
            events.last(),
            Some(RuntimeEvent::Exit { code: c, .. }) if *c == code
        ));
        assert!(!events
            .iter()
            .any(|e| matches!(e, RuntimeEvent::RuntimeError { .. })));
    }
}

#[test]
fn entry_returning_without_exit_reports_code_zero() {
    let (mut bridge, rx) = RuntimeBridge::new();
    let session = bridge
        .run(write_module(1, "done\n", false))
        .expect("run");
    let events = collect_session(&rx, session);
    assert_eq!(stdout_of(&events), "done\n");
    assert!(matches!(
        events.last(),
        Some(RuntimeEvent::Exit { code: 0, .. })
    ));
}

#[test]
fn exported_memory_is_rebound_before_execution() {
    // The module defines and exports its own memory; fd_write only works
    // if the syscall layer observes that memory.
    let (mut bridge, rx) = RuntimeBridge::new();
    let session = bridge
        .run(write_module(1, "exported memory\n", false))
        .expect("run");
    let events = collect_session(&rx, session);
    assert_eq!(stdout_of(&events), "exported memory\n");
}

#[test]
fn imported_memory_is_injected_and_bound() {
    let (mut bridge, rx) = RuntimeBridge::new();
    let session = bridge
        .run(write_module(2, "imported memory\n", true))
        .expect("run");
    let events = collect_session(&rx, session);
    let stderr: String = events
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::Stderr { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(stderr, "imported memory\n");
    assert!(matches!(
        events.last(),
        Some(RuntimeEvent::Exit { code: 0, .. })
    ));
}

#[test]
fn missing_magic_header_is_rejected_before_execution() {
    let (mut bridge, rx) = RuntimeBridge::new();
    let session = bridge.run(b"\x7fELF not wasm".to_vec()).expect("run");
    let events = collect_session(&rx, session);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        RuntimeEvent::RuntimeError { message, .. } if message.contains("magic")
    ));
}

#[test]
fn trap_reports_runtime_error_not_exit() {
    let (mut bridge, rx) = RuntimeBridge::new();
    let session = bridge.run(trap_module()).expect("run");
    let events = collect_session(&rx, session);
    assert!(matches!(
        events.last(),
        Some(RuntimeEvent::RuntimeError { .. })
    ));
    assert!(!events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::Exit { .. })));
}

#[test]
fn stdin_roundtrip_echoes_sent_text() {
    let (mut bridge, rx) = RuntimeBridge::new();
    let session = bridge.run(echo_module()).expect("run");
    // The guest may or may not be blocked in fd_read yet; the mailbox
    // handshake covers both.
    let receipt = bridge.send_stdin("ping\n").expect("live session");
    assert_eq!(receipt.written, 5);
    assert_eq!(receipt.truncated, 0);
    let events = collect_session(&rx, session);
    assert_eq!(stdout_of(&events), "ping\n");
    assert!(matches!(
        events.last(),
        Some(RuntimeEvent::Exit { code: 0, .. })
    ));
}

#[test]
fn disabled_stdin_reads_eof_immediately() {
    let (mut bridge, rx) = RuntimeBridge::with_stdin_disabled();
    let session = bridge.run(echo_module()).expect("run");
    let events = collect_session(&rx, session);
    // Zero bytes read, so zero bytes echoed.
    assert_eq!(stdout_of(&events), "");
    assert!(matches!(
        events.last(),
        Some(RuntimeEvent::Exit { code: 0, .. })
    ));
}

#[test]
fn eof_unblocks_reader_with_zero_bytes() {
    let (mut bridge, rx) = RuntimeBridge::new();
    let session = bridge.run(echo_module()).expect("run");
    std::thread::sleep(Duration::from_millis(50));
    bridge.send_eof();
    let events = collect_session(&rx, session);
    assert_eq!(stdout_of(&events), "");
    assert!(matches!(
        events.last(),
        Some(RuntimeEvent::Exit { code: 0, .. })
    ));
}

#[test]
fn terminate_stops_a_spinning_guest() {
    let (mut bridge, rx) = RuntimeBridge::new();
    let session = bridge.run(spin_module()).expect("run");
    std::thread::sleep(Duration::from_millis(50));
    bridge.terminate();
    // Detached session: no terminal event is delivered for it.
    assert!(bridge.active_session().is_none());
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.session(), session);
        assert!(!event.is_terminal());
    }
}

#[test]
fn starting_a_new_run_supersedes_the_previous_session() {
    let (mut bridge, rx) = RuntimeBridge::new();
    let first = bridge.run(spin_module()).expect("first run");
    let second = bridge.run(exit_module(3)).expect("second run");
    assert_ne!(first, second);
    let events = collect_session(&rx, second);
    assert!(matches!(
        events.last(),
        Some(RuntimeEvent::Exit { code: 3, .. })
    ));
}
