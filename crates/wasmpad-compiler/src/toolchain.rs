//! Clang toolchain driver: asset provisioning, the two compile stages
//! and output validation.

use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use sha2::{Digest as _, Sha256};

use crate::diagnostics::{has_errors, parse_diagnostics};
use crate::{CompileOutcome, FailureKind, ProgressUpdate};
use wasmpad_contracts::{WASM_HEADER_BYTES, WASM_MAGIC};

/// Per-asset download size estimates. Receipts are streamed against
/// these, so the reported fraction stays below 1.0 until the readiness
/// step even when an estimate is off.
const ASSETS: &[(&str, u64)] = &[
    ("wasi-sysroot.tar", 7_000_000),
    ("libclang_rt.builtins-wasm32.a", 200_000),
];

const DEFAULT_TOOLCHAIN_URL: &str = "https://wasmpad.dev/toolchain";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Abstraction over the real toolchain so the supervisor can be tested
/// with scripted drivers.
pub trait ToolchainDriver: Send {
    /// One-time preparation (asset fetch and unpack for the real
    /// driver). Runs at most once per worker.
    fn prepare(&mut self, progress: &mut dyn FnMut(ProgressUpdate)) -> Result<()>;

    fn compile(&mut self, source: &str, progress: &mut dyn FnMut(ProgressUpdate))
        -> CompileOutcome;
}

/// Shared handle to the pid of the toolchain process currently running
/// on the worker, so the supervisor can kill it from outside after a
/// crash or deadline expiry.
#[derive(Debug, Clone, Default)]
pub struct KillHandle {
    pid: Arc<Mutex<Option<u32>>>,
}

impl KillHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, pid: u32) {
        if let Ok(mut slot) = self.pid.lock() {
            *slot = Some(pid);
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.pid.lock() {
            *slot = None;
        }
    }

    /// Kills whatever toolchain process is registered, if any. Safe to
    /// call when nothing is running.
    pub fn kill_active(&self) {
        let pid = match self.pid.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        #[cfg(unix)]
        if let Some(pid) = pid {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        let _ = pid;
    }
}

/// Drives `clang` targeting wasm32-wasip1. Asset provisioning, the
/// compile and link stages, and the output gates all live here; the
/// supervisor only sees the `ToolchainDriver` surface.
pub struct ClangToolchain {
    cc: PathBuf,
    base_url: String,
    cache_dir: PathBuf,
    sysroot: Option<PathBuf>,
    kill: KillHandle,
    prepared: bool,
}

impl ClangToolchain {
    pub fn new(kill: KillHandle) -> Self {
        let cc = std::env::var_os("WASMPAD_CC")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("clang"));
        let base_url = std::env::var("WASMPAD_TOOLCHAIN_URL")
            .unwrap_or_else(|_| DEFAULT_TOOLCHAIN_URL.to_string());
        let cache_dir = std::env::var_os("WASMPAD_TOOLCHAIN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("wasmpad-toolchain"));
        let sysroot = std::env::var_os("WASMPAD_SYSROOT").map(PathBuf::from);
        Self {
            cc,
            base_url,
            cache_dir,
            sysroot,
            kill,
            prepared: false,
        }
    }

    fn sysroot_dir(&self) -> PathBuf {
        self.sysroot
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("wasi-sysroot"))
    }

    /// The fetched compiler-rt builtins archive, when the cache holds
    /// one. With an out-of-band sysroot the toolchain's own resource
    /// directory is expected to provide the builtins instead.
    fn builtins_archive(&self) -> Option<PathBuf> {
        let path = self.cache_dir.join("libclang_rt.builtins-wasm32.a");
        path.exists().then_some(path)
    }

    /// Downloads one asset into the cache, streaming received bytes
    /// against the size estimate. Returns the sha256 of the bytes.
    fn fetch_asset(
        &self,
        name: &str,
        estimate: u64,
        progress: &mut dyn FnMut(ProgressUpdate),
    ) -> Result<String> {
        let url = format!("{}/{name}", self.base_url.trim_end_matches('/'));
        let dest = self.cache_dir.join(name);

        let resp = ureq::get(&url)
            .call()
            .with_context(|| format!("GET {url}"))?;
        let mut reader = resp.into_body().into_reader();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut chunk).with_context(|| format!("read {url}"))?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            progress(ProgressUpdate {
                stage: "fetch".to_string(),
                fraction: capped_fraction(buf.len() as u64, estimate),
                detail: Some(name.to_string()),
            });
        }

        fs::write(&dest, &buf).with_context(|| format!("write {}", dest.display()))?;

        let mut hasher = Sha256::new();
        hasher.update(&buf);
        Ok(hex_lower(&hasher.finalize()))
    }

    fn ensure_assets(&self, progress: &mut dyn FnMut(ProgressUpdate)) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("create {}", self.cache_dir.display()))?;

        let records = self.cache_dir.join("sha256.txt");
        if records.exists() && self.sysroot_dir().exists() {
            progress(ProgressUpdate {
                stage: "ready".to_string(),
                fraction: 1.0,
                detail: None,
            });
            return Ok(());
        }

        let mut lines = String::new();
        for (name, estimate) in ASSETS {
            let digest = self.fetch_asset(name, *estimate, progress)?;
            lines.push_str(&format!("{digest}  {name}\n"));
        }

        let sysroot_tar = self.cache_dir.join("wasi-sysroot.tar");
        let unpack_dir = self.sysroot_dir();
        progress(ProgressUpdate {
            stage: "unpack".to_string(),
            fraction: 0.98,
            detail: Some("wasi-sysroot".to_string()),
        });
        let file = fs::File::open(&sysroot_tar)
            .with_context(|| format!("open {}", sysroot_tar.display()))?;
        let mut ar = tar::Archive::new(file);
        ar.unpack(&unpack_dir)
            .with_context(|| format!("unpack {}", unpack_dir.display()))?;

        fs::write(&records, lines).context("write sha256 records")?;
        progress(ProgressUpdate {
            stage: "ready".to_string(),
            fraction: 1.0,
            detail: None,
        });
        Ok(())
    }

    /// Runs one toolchain invocation with the pid registered on the
    /// kill handle for its duration.
    fn run_stage(&self, cmd: &mut Command) -> Result<std::process::Output> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {:?}", cmd.get_program()))?;
        self.kill.set(child.id());
        let out = child.wait_with_output();
        self.kill.clear();
        out.context("wait for toolchain process")
    }

    fn compile_inner(
        &self,
        source: &str,
        progress: &mut dyn FnMut(ProgressUpdate),
    ) -> Result<CompileOutcome> {
        let work = std::env::temp_dir().join(format!(
            "wasmpad-{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&work).with_context(|| format!("create {}", work.display()))?;

        let src_path = work.join("main.cpp");
        let obj_path = work.join("main.o");
        let wasm_path = work.join("main.wasm");
        fs::write(&src_path, source).context("write source")?;

        let sysroot = self.sysroot_dir();
        let mut stdout_all = String::new();
        let mut stderr_all = String::new();
        let mut diagnostics = Vec::new();

        progress(ProgressUpdate {
            stage: "compile".to_string(),
            fraction: 0.2,
            detail: None,
        });
        let out = self.run_stage(
            Command::new(&self.cc)
                .arg("-c")
                .arg("--target=wasm32-wasip1")
                .arg(format!("--sysroot={}", sysroot.display()))
                .arg("-std=c++17")
                .arg("-O2")
                .arg("-o")
                .arg(&obj_path)
                .arg(&src_path),
        )?;
        stdout_all.push_str(&String::from_utf8_lossy(&out.stdout));
        let stage_err = String::from_utf8_lossy(&out.stderr).into_owned();
        diagnostics.extend(parse_diagnostics(&stage_err));
        stderr_all.push_str(&stage_err);
        if has_errors(&diagnostics) || !out.status.success() {
            if !has_errors(&diagnostics) {
                diagnostics.push(crate::Diagnostic::synthetic(format!(
                    "compiler exited with {}",
                    out.status
                )));
            }
            let _ = fs::remove_dir_all(&work);
            return Ok(CompileOutcome::failed(
                FailureKind::CompileFailure,
                diagnostics,
                stdout_all,
                stderr_all,
            ));
        }

        progress(ProgressUpdate {
            stage: "link".to_string(),
            fraction: 0.6,
            detail: None,
        });
        let mut link = Command::new(&self.cc);
        link.arg("--target=wasm32-wasip1")
            .arg(format!("--sysroot={}", sysroot.display()))
            .arg(&obj_path)
            .arg("-o")
            .arg(&wasm_path)
            .arg("-lc++")
            .arg("-lc++abi");
        // Fetched builtins go on the link line; without them a clang
        // that ships no wasm32 compiler-rt cannot resolve the intrinsic
        // calls libc++ lowers to.
        if let Some(archive) = self.builtins_archive() {
            link.arg(archive);
        }
        let out = self.run_stage(&mut link)?;
        stdout_all.push_str(&String::from_utf8_lossy(&out.stdout));
        let stage_err = String::from_utf8_lossy(&out.stderr).into_owned();
        diagnostics.extend(parse_diagnostics(&stage_err));
        stderr_all.push_str(&stage_err);
        if has_errors(&diagnostics) || !out.status.success() {
            if !has_errors(&diagnostics) {
                diagnostics.push(crate::Diagnostic::synthetic(format!(
                    "linker exited with {}",
                    out.status
                )));
            }
            let _ = fs::remove_dir_all(&work);
            return Ok(CompileOutcome::failed(
                FailureKind::LinkFailure,
                diagnostics,
                stdout_all,
                stderr_all,
            ));
        }

        progress(ProgressUpdate {
            stage: "validate".to_string(),
            fraction: 0.9,
            detail: None,
        });
        let wasm = fs::read(&wasm_path).with_context(|| format!("read {}", wasm_path.display()))?;
        let _ = fs::remove_dir_all(&work);

        if let Err(reason) = validate_binary(&wasm) {
            diagnostics.push(crate::Diagnostic::synthetic(reason));
            return Ok(CompileOutcome::failed(
                FailureKind::InvalidBinary,
                diagnostics,
                stdout_all,
                stderr_all,
            ));
        }

        progress(ProgressUpdate {
            stage: "ready".to_string(),
            fraction: 1.0,
            detail: None,
        });
        Ok(CompileOutcome::succeeded(wasm, diagnostics, stdout_all, stderr_all))
    }
}

impl ToolchainDriver for ClangToolchain {
    fn prepare(&mut self, progress: &mut dyn FnMut(ProgressUpdate)) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        // An explicit sysroot means assets are provided out of band.
        if self.sysroot.is_none() {
            self.ensure_assets(progress)?;
        }
        self.prepared = true;
        Ok(())
    }

    fn compile(
        &mut self,
        source: &str,
        progress: &mut dyn FnMut(ProgressUpdate),
    ) -> CompileOutcome {
        match self.compile_inner(source, progress) {
            Ok(outcome) => outcome,
            Err(err) => CompileOutcome::synthetic(
                FailureKind::CompileFailure,
                format!("toolchain failure: {err:#}"),
            ),
        }
    }
}

/// Caps download progress below 1.0; only the readiness step reports
/// completion.
pub(crate) fn capped_fraction(received: u64, estimate: u64) -> f64 {
    if estimate == 0 {
        return 0.95;
    }
    (received as f64 / estimate as f64).min(0.95)
}

/// Output gates: minimum length, magic header, then a full
/// `wasmparser` validation pass.
pub fn validate_binary(bytes: &[u8]) -> Result<(), String> {
    if bytes.len() < WASM_HEADER_BYTES {
        return Err(format!(
            "output too short to be a wasm module ({} bytes)",
            bytes.len()
        ));
    }
    if bytes[..WASM_MAGIC.len()] != WASM_MAGIC {
        return Err("output missing WebAssembly magic header".to_string());
    }
    wasmparser::Validator::new()
        .validate_all(bytes)
        .map(|_| ())
        .map_err(|err| format!("output failed validation: {err}"))
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_encoder::Module;

    #[test]
    fn empty_wasm_module_passes_all_gates() {
        let bytes = Module::new().finish();
        assert!(validate_binary(&bytes).is_ok());
    }

    #[test]
    fn short_output_is_rejected() {
        let err = validate_binary(&[0x00, 0x61, 0x73]).unwrap_err();
        assert!(err.contains("too short"));
    }

    #[test]
    fn wrong_magic_is_rejected_before_validation() {
        let err = validate_binary(b"\x7fELF\x01\x01\x01\x00").unwrap_err();
        assert!(err.contains("magic"));
    }

    #[test]
    fn magic_alone_does_not_satisfy_the_validator() {
        // Correct magic, bogus version and body.
        let err = validate_binary(b"\x00asm\xff\xff\xff\xff").unwrap_err();
        assert!(err.contains("validation"));
    }

    #[test]
    fn download_fraction_is_capped() {
        assert_eq!(capped_fraction(0, 100), 0.0);
        assert_eq!(capped_fraction(50, 100), 0.5);
        assert_eq!(capped_fraction(100, 100), 0.95);
        assert_eq!(capped_fraction(500, 100), 0.95);
        assert_eq!(capped_fraction(10, 0), 0.95);
    }

    #[cfg(unix)]
    #[test]
    fn link_stage_passes_cached_builtins_to_the_compiler() {
        use std::os::unix::fs::PermissionsExt;

        let root = std::env::temp_dir().join(format!(
            "wasmpad-cc-{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let cache = root.join("toolchain");
        fs::create_dir_all(cache.join("wasi-sysroot")).expect("create cache");
        fs::write(cache.join("sha256.txt"), "").expect("records");
        fs::write(cache.join("libclang_rt.builtins-wasm32.a"), b"!<arch>\n").expect("archive");

        // Fake compiler: log every invocation, emit a minimal valid
        // module at the -o target.
        let log = root.join("cc-args.log");
        let cc = root.join("fake-cc.sh");
        let script = format!(
            "#!/bin/sh\n\
             printf '%s\\n' \"$*\" >> {log}\n\
             out=\n\
             while [ $# -gt 0 ]; do\n\
             \x20 if [ \"$1\" = \"-o\" ]; then out=$2; fi\n\
             \x20 shift\n\
             done\n\
             printf '\\000asm\\001\\000\\000\\000' > \"$out\"\n",
            log = log.display()
        );
        fs::write(&cc, script).expect("write fake cc");
        let mut perms = fs::metadata(&cc).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&cc, perms).expect("chmod");

        std::env::set_var("WASMPAD_CC", &cc);
        std::env::set_var("WASMPAD_TOOLCHAIN_DIR", &cache);
        std::env::remove_var("WASMPAD_SYSROOT");
        let mut driver = ClangToolchain::new(KillHandle::new());
        driver.prepare(&mut |_| {}).expect("prepare from warm cache");
        let outcome = driver.compile("int main() { return 0; }", &mut |_| {});
        std::env::remove_var("WASMPAD_CC");
        std::env::remove_var("WASMPAD_TOOLCHAIN_DIR");

        assert!(outcome.success, "diagnostics: {:?}", outcome.diagnostics);
        let args = fs::read_to_string(&log).expect("cc log");
        let mut invocations = args.lines();
        let compile_args = invocations.next().expect("compile invocation");
        assert!(compile_args.contains("-c"));
        assert!(!compile_args.contains("libclang_rt.builtins-wasm32.a"));
        let link_args = invocations.next().expect("link invocation");
        assert!(link_args.contains("libclang_rt.builtins-wasm32.a"));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn kill_handle_tolerates_empty_state() {
        let kill = KillHandle::new();
        kill.kill_active();
        kill.set(u32::MAX);
        kill.clear();
        kill.kill_active();
    }
}
