//! Shared, version-pinned protocol identifiers and wire-layout constants.
//!
//! These constants are the single source of truth for schema strings that
//! appear in machine-readable reports and for the byte layouts that the
//! runtime bridge and the execution host agree on.

pub const WASMPAD_DIAG_SCHEMA_VERSION: &str = "wasmpad.diag@0.1.0";
pub const WASMPAD_COMPILE_REPORT_SCHEMA_VERSION: &str = "wasmpad.compile.report@0.1.0";
pub const WASMPAD_RUN_REPORT_SCHEMA_VERSION: &str = "wasmpad.run.report@0.1.0";
pub const WASMPAD_EXEC_REPORT_SCHEMA_VERSION: &str = "wasmpad.exec.report@0.1.0";

/// First four bytes of every valid WebAssembly binary (`\0asm`).
pub const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];

/// Minimum plausible module size: magic plus version word.
pub const WASM_HEADER_BYTES: usize = 8;

// Stdin mailbox protocol, shared between the runtime bridge (producer)
// and the syscall layer (consumer): one slot of STDIN_CAPACITY payload
// bytes guarded by a signal word.
pub const STDIN_CAPACITY: usize = 4096;

pub const STDIN_SIGNAL_EMPTY: i32 = 0;
pub const STDIN_SIGNAL_DATA: i32 = 1;
pub const STDIN_SIGNAL_EOF: i32 = 2;
