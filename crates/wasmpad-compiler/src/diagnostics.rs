//! Diagnostic model and the clang stderr parser.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub line: u32,
    pub column: u32,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    /// Diagnostic with no source position, for failures that did not
    /// come out of the toolchain's own stream (crash, timeout, invalid
    /// output binary).
    pub fn synthetic(message: impl Into<String>) -> Self {
        Self {
            line: 0,
            column: 0,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}:{}: {}: {}", self.line, self.column, sev, self.message)
    }
}

fn line_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[^:]+:(\d+):(\d+):\s+(error|warning):\s+(.+)$")
            .unwrap_or_else(|e| panic!("diagnostic pattern: {e}"))
    })
}

/// Parses `file:line:col: severity: message` lines out of a compiler
/// stream. Lines that do not match the grammar (notes, carets, source
/// excerpts) are ignored. Positions that overflow u32 are ignored the
/// same way rather than mis-attributed.
pub fn parse_diagnostics(stream: &str) -> Vec<Diagnostic> {
    let re = line_pattern();
    let mut out = Vec::new();
    for line in stream.lines() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let (Ok(line_no), Ok(column)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
            continue;
        };
        let severity = match &caps[3] {
            "error" => Severity::Error,
            _ => Severity::Warning,
        };
        out.push(Diagnostic {
            line: line_no,
            column,
            severity,
            message: caps[4].to_string(),
        });
    }
    out
}

pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}
