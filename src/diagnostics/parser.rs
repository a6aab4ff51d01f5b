//! Line-oriented extraction of errors and warnings from TeX engine logs.
//!
//! The log is scanned once, top to bottom. Each line is matched against the
//! recognized shapes in priority order and the first match wins; anything
//! else is ignored. Only a ±2 line window is consulted, for context snippets.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_RERUN_PATTERNS;
use crate::diagnostics::{CompilationError, CompilationWarning, ErrorKind, WarningKind};

const CONTEXT_RADIUS: usize = 2;

/// `<file>:<line>:[<column>:] <rest>` as printed under `-file-line-error`.
static FILE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s:!][^:]*):(?P<line>\d+):(?:(?P<column>\d+):)?\s*(?P<rest>.*)$")
        .unwrap()
});

static UNDEFINED_CONTROL_SEQUENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^undefined control sequence").unwrap());

static PACKAGE_NOTICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:Package|Class) (?P<name>\S+) (?P<level>Warning|Info):\s*(?P<message>.*)$")
        .unwrap()
});

/// `[<emitter> [<subsystem>] ]Warning[ (<tag>)]: <message>`, e.g. `LaTeX Font
/// Warning:`, `LaTeX3 Warning:`, `Babel Warning:` or `pdfTeX warning (ext4):`.
static BARE_WARNING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[A-Za-z][\w.-]*(?: [A-Za-z][\w.-]*)? )?(?i:warning)(?: \([^)]*\))?:\s*(?P<message>.*)$",
    )
    .unwrap()
});

/// Source-like files whose `file:line:` prefix marks an error even without an
/// explicit `Error:` keyword.
static SOURCE_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.(?:tex|ltx|sty|cls|bib|dtx|def|fd|cfg|clo)$").unwrap());

/// Errors and warnings found in one log, in log order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedLog {
    pub errors: Vec<CompilationError>,
    pub warnings: Vec<CompilationWarning>,
}

impl ParsedLog {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

enum Finding {
    Error(CompilationError),
    Warning(CompilationWarning),
}

/// Parser for TeX engine output.
///
/// Rerun detection is driven by a list of case-insensitive substrings so that
/// callers can adapt it to engines or languages with different wording.
#[derive(Debug, Clone)]
pub struct LogParser {
    rerun_patterns: Vec<String>,
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new(DEFAULT_RERUN_PATTERNS.iter().copied())
    }
}

impl LogParser {
    pub fn new<I, S>(rerun_patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            rerun_patterns: rerun_patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// True if the log asks for another pass to settle references or labels.
    pub fn needs_another_pass(&self, log: &str) -> bool {
        if self.rerun_patterns.is_empty() {
            return false;
        }
        let log = log.to_lowercase();
        self.rerun_patterns.iter().any(|p| log.contains(p.as_str()))
    }

    /// Extract every recognizable error and warning from `log`.
    pub fn parse(&self, log: &str) -> ParsedLog {
        let lines: Vec<&str> = log.lines().collect();
        let mut parsed = ParsedLog::default();

        for (index, raw) in lines.iter().enumerate() {
            let line = raw.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            match classify(line, || context_window(&lines, index)) {
                Some(Finding::Error(error)) => parsed.errors.push(error),
                Some(Finding::Warning(warning)) => parsed.warnings.push(warning),
                None => {}
            }
        }

        tracing::debug!(
            errors = parsed.errors.len(),
            warnings = parsed.warnings.len(),
            "Parsed compiler log"
        );
        parsed
    }
}

fn classify(line: &str, context: impl Fn() -> String) -> Option<Finding> {
    let position = FILE_LINE.captures(line).and_then(|caps| {
        let line_no = caps.name("line")?.as_str().parse::<u32>().ok()?;
        let column = caps
            .name("column")
            .and_then(|c| c.as_str().parse::<u32>().ok());
        Some((
            caps.name("file")?.as_str().to_string(),
            line_no,
            column,
            caps.name("rest").map_or("", |r| r.as_str()).trim().to_string(),
        ))
    });

    // file:line error, including the undefined-control-sequence form
    if let Some((file, line_no, column, rest)) = &position {
        if rest.contains("Error:") || UNDEFINED_CONTROL_SEQUENCE.is_match(rest) {
            return Some(Finding::Error(CompilationError {
                message: rest.clone(),
                kind: ErrorKind::Error,
                file: Some(file.clone()),
                line: Some(*line_no),
                column: *column,
                context: Some(context()),
            }));
        }
    }

    if let Some(message) = line.strip_prefix('!') {
        let message = message.trim();
        if message.is_empty() {
            return None;
        }
        return Some(Finding::Error(CompilationError {
            message: message.to_string(),
            kind: ErrorKind::Fatal,
            file: None,
            line: None,
            column: None,
            context: Some(context()),
        }));
    }

    if let Some((file, line_no, column, rest)) = &position {
        if rest.contains("Warning:") {
            return Some(Finding::Warning(CompilationWarning {
                message: rest.clone(),
                kind: WarningKind::Warning,
                file: Some(file.clone()),
                line: Some(*line_no),
                column: *column,
                context: Some(context()),
            }));
        }
    }

    let trimmed = line.trim_start();

    // The package form is checked before the bare form, which is its suffix.
    if let Some(caps) = PACKAGE_NOTICE.captures(trimmed) {
        let name = caps.name("name").map_or("", |m| m.as_str());
        let message = caps.name("message").map_or("", |m| m.as_str()).trim();
        let kind = match caps.name("level").map(|m| m.as_str()) {
            Some("Info") => WarningKind::Info,
            _ => WarningKind::Warning,
        };
        return Some(Finding::Warning(CompilationWarning {
            message: format!("{}: {}", name, message),
            kind,
            file: None,
            line: None,
            column: None,
            context: Some(context()),
        }));
    }

    if let Some(caps) = BARE_WARNING.captures(trimmed) {
        let message = caps.name("message").map_or("", |m| m.as_str()).trim();
        return Some(Finding::Warning(CompilationWarning {
            message: message.to_string(),
            kind: WarningKind::Warning,
            file: None,
            line: None,
            column: None,
            context: Some(context()),
        }));
    }

    position.and_then(|(file, line_no, column, rest)| {
        source_position_error(file, line_no, column, rest, &context)
    })
}

/// Extension beyond the keyword rules above: engines print most errors as a
/// bare `file:line: message`, so a position in a TeX source file counts as an
/// error even without `Error:` in the text.
fn source_position_error(
    file: String,
    line_no: u32,
    column: Option<u32>,
    rest: String,
    context: impl Fn() -> String,
) -> Option<Finding> {
    if !SOURCE_FILE.is_match(&file) || rest.is_empty() {
        return None;
    }
    Some(Finding::Error(CompilationError {
        message: rest,
        kind: ErrorKind::Error,
        file: Some(file),
        line: Some(line_no),
        column,
        context: Some(context()),
    }))
}

fn context_window(lines: &[&str], index: usize) -> String {
    let start = index.saturating_sub(CONTEXT_RADIUS);
    let end = (index + CONTEXT_RADIUS + 1).min(lines.len());
    lines[start..end]
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}
