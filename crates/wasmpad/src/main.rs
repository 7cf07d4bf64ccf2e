use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use wasmpad_compiler::{
    CompileOutcome, CompileStatus, CompileSupervisor, Diagnostic, FailureKind, ProgressUpdate,
    SupervisorConfig, TaskResult,
};
use wasmpad_contracts::{
    WASMPAD_COMPILE_REPORT_SCHEMA_VERSION, WASMPAD_DIAG_SCHEMA_VERSION,
    WASMPAD_EXEC_REPORT_SCHEMA_VERSION, WASMPAD_RUN_REPORT_SCHEMA_VERSION,
};
use wasmpad_runtime::{feed_stdin, RuntimeBridge, RuntimeEvent};

const FEED_CHUNK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "wasmpad")]
#[command(about = "Compile C++ to wasm32-wasip1 and run it in a sandboxed host.", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Compile a source file to a wasm module.
    Compile {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
        #[arg(long)]
        report_json: bool,
    },
    /// Run an existing wasm module.
    Run {
        #[arg(long)]
        wasm: PathBuf,
        /// Feed this file as the program's stdin, then EOF.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Disable stdin entirely; every read sees EOF.
        #[arg(long)]
        no_stdin: bool,
        #[arg(long)]
        report_json: bool,
    },
    /// Compile and, on success, immediately run.
    Exec {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
        #[arg(long)]
        report_json: bool,
    },
}

#[derive(Debug, Serialize)]
struct CompileSection {
    ok: bool,
    status: CompileStatus,
    diag_schema_version: &'static str,
    diagnostics: Vec<Diagnostic>,
    stdout: String,
    stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    out: Option<String>,
}

impl CompileSection {
    fn from_outcome(outcome: &CompileOutcome, out: Option<&PathBuf>) -> Self {
        Self {
            ok: outcome.success,
            status: outcome.status(),
            diag_schema_version: WASMPAD_DIAG_SCHEMA_VERSION,
            diagnostics: outcome.diagnostics.clone(),
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
            failure: outcome.failure,
            out: out.map(|p| p.display().to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompileReport {
    schema_version: &'static str,
    #[serde(flatten)]
    compile: CompileSection,
}

#[derive(Debug, Serialize)]
struct RunSection {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_error: Option<String>,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Serialize)]
struct RunReport {
    schema_version: &'static str,
    #[serde(flatten)]
    run: RunSection,
}

#[derive(Debug, Serialize)]
struct ExecReport {
    schema_version: &'static str,
    ok: bool,
    compile: CompileSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<RunSection>,
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Compile {
            source,
            out,
            timeout_ms,
            report_json,
        } => cmd_compile(&source, out.as_ref(), timeout_ms, report_json),
        Cmd::Run {
            wasm,
            input,
            no_stdin,
            report_json,
        } => cmd_run(&wasm, input.as_ref(), no_stdin, report_json),
        Cmd::Exec {
            source,
            input,
            timeout_ms,
            report_json,
        } => cmd_exec(&source, input.as_ref(), timeout_ms, report_json),
    }
}

fn supervisor_config(timeout_ms: Option<u64>) -> SupervisorConfig {
    let mut config = SupervisorConfig::default();
    if let Some(ms) = timeout_ms {
        config.compile_timeout = Duration::from_millis(ms);
    }
    config
}

fn progress_to_stderr() -> impl FnMut(ProgressUpdate) {
    |update: ProgressUpdate| {
        let pct = (update.fraction * 100.0).round() as u32;
        match &update.detail {
            Some(detail) => eprintln!("[{}] {pct}% {detail}", update.stage),
            None => eprintln!("[{}] {pct}%", update.stage),
        }
    }
}

fn compile_source(source: &std::path::Path, timeout_ms: Option<u64>) -> Result<TaskResult> {
    let text = std::fs::read_to_string(source)
        .with_context(|| format!("read {}", source.display()))?;
    let mut supervisor = CompileSupervisor::new(supervisor_config(timeout_ms));
    supervisor
        .submit(&text)
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    supervisor.wait(&mut progress_to_stderr())
}

fn cmd_compile(
    source: &std::path::Path,
    out: Option<&PathBuf>,
    timeout_ms: Option<u64>,
    report_json: bool,
) -> Result<std::process::ExitCode> {
    let result = compile_source(source, timeout_ms)?;

    let out_path = match (&result.outcome.wasm, out) {
        (Some(wasm), Some(path)) => {
            std::fs::write(path, wasm).with_context(|| format!("write {}", path.display()))?;
            Some(path)
        }
        _ => None,
    };

    if report_json {
        let report = CompileReport {
            schema_version: WASMPAD_COMPILE_REPORT_SCHEMA_VERSION,
            compile: CompileSection::from_outcome(&result.outcome, out_path),
        };
        println!("{}", serde_json::to_string(&report)?);
    } else {
        for diag in &result.outcome.diagnostics {
            eprintln!("{diag}");
        }
        if let Some(path) = out_path {
            eprintln!("wrote {}", path.display());
        }
    }

    Ok(match result.status {
        CompileStatus::Ready => std::process::ExitCode::SUCCESS,
        CompileStatus::Error => std::process::ExitCode::FAILURE,
    })
}

/// Runs a module to completion, streaming output unless a JSON report
/// was requested, and returns the collected run section.
fn run_module(
    binary: Vec<u8>,
    input: Option<&PathBuf>,
    no_stdin: bool,
    stream: bool,
) -> Result<RunSection> {
    let (mut bridge, events) = if no_stdin {
        RuntimeBridge::with_stdin_disabled()
    } else {
        RuntimeBridge::new()
    };
    bridge.run(binary)?;

    if !no_stdin {
        match input {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("read {}", path.display()))?;
                if let Some(channel) = bridge.stdin_channel() {
                    feed_stdin(&channel, &bytes, FEED_CHUNK_TIMEOUT);
                }
            }
            None => bridge.send_eof(),
        }
    }

    let mut section = RunSection {
        ok: false,
        exit_code: None,
        runtime_error: None,
        stdout: String::new(),
        stderr: String::new(),
    };
    for event in events.iter() {
        match event {
            RuntimeEvent::Stdout { text, .. } => {
                if stream {
                    print!("{text}");
                }
                section.stdout.push_str(&text);
            }
            RuntimeEvent::Stderr { text, .. } => {
                if stream {
                    eprint!("{text}");
                }
                section.stderr.push_str(&text);
            }
            RuntimeEvent::Exit { code, .. } => {
                section.exit_code = Some(code);
                section.ok = code == 0;
                break;
            }
            RuntimeEvent::RuntimeError { message, .. } => {
                if stream {
                    eprintln!("runtime error: {message}");
                }
                section.runtime_error = Some(message);
                break;
            }
        }
    }
    bridge.wait_finished();
    Ok(section)
}

/// Maps a guest exit code to a process exit byte. Codes outside u8 range
/// must still read as failure, not wrap or clamp into success; a run that
/// produced no exit code (runtime error) is a failure too.
fn exit_code_byte(code: Option<i32>) -> u8 {
    match code {
        Some(code) => u8::try_from(code).unwrap_or(1),
        None => 1,
    }
}

fn run_exit_code(section: &RunSection) -> std::process::ExitCode {
    std::process::ExitCode::from(exit_code_byte(section.exit_code))
}

fn cmd_run(
    wasm: &std::path::Path,
    input: Option<&PathBuf>,
    no_stdin: bool,
    report_json: bool,
) -> Result<std::process::ExitCode> {
    let binary =
        std::fs::read(wasm).with_context(|| format!("read {}", wasm.display()))?;
    let section = run_module(binary, input, no_stdin, !report_json)?;

    if report_json {
        let report = RunReport {
            schema_version: WASMPAD_RUN_REPORT_SCHEMA_VERSION,
            run: section,
        };
        println!("{}", serde_json::to_string(&report)?);
        return Ok(std::process::ExitCode::SUCCESS);
    }
    Ok(run_exit_code(&section))
}

fn cmd_exec(
    source: &std::path::Path,
    input: Option<&PathBuf>,
    timeout_ms: Option<u64>,
    report_json: bool,
) -> Result<std::process::ExitCode> {
    let result = compile_source(source, timeout_ms)?;

    if !report_json {
        for diag in &result.outcome.diagnostics {
            eprintln!("{diag}");
        }
    }

    let Some(wasm) = result.outcome.wasm.clone() else {
        if report_json {
            let report = ExecReport {
                schema_version: WASMPAD_EXEC_REPORT_SCHEMA_VERSION,
                ok: false,
                compile: CompileSection::from_outcome(&result.outcome, None),
                run: None,
            };
            println!("{}", serde_json::to_string(&report)?);
        }
        return Ok(std::process::ExitCode::FAILURE);
    };

    let section = run_module(wasm, input, false, !report_json)?;

    if report_json {
        let ok = section.ok;
        let report = ExecReport {
            schema_version: WASMPAD_EXEC_REPORT_SCHEMA_VERSION,
            ok,
            compile: CompileSection::from_outcome(&result.outcome, None),
            run: Some(section),
        };
        println!("{}", serde_json::to_string(&report)?);
        return Ok(std::process::ExitCode::SUCCESS);
    }
    Ok(run_exit_code(&section))
}

#[cfg(test)]
mod tests {
    use super::exit_code_byte;

    #[test]
    fn in_range_exit_codes_pass_through() {
        assert_eq!(exit_code_byte(Some(0)), 0);
        assert_eq!(exit_code_byte(Some(1)), 1);
        assert_eq!(exit_code_byte(Some(127)), 127);
        assert_eq!(exit_code_byte(Some(255)), 255);
    }

    #[test]
    fn out_of_range_exit_codes_read_as_failure() {
        assert_eq!(exit_code_byte(Some(-1)), 1);
        assert_eq!(exit_code_byte(Some(256)), 1);
        assert_eq!(exit_code_byte(Some(i32::MIN)), 1);
        assert_eq!(exit_code_byte(None), 1);
    }
}
