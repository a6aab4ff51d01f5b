//! Structured diagnostics extracted from compiler logs.
//!
//! [`LogParser`] turns the free-form output of a TeX engine into
//! [`CompilationError`] and [`CompilationWarning`] records and decides whether
//! another compiler pass is needed to settle cross-references.

pub mod parser;

pub use parser::{LogParser, ParsedLog};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Error,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningKind {
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationError {
    pub message: String,
    pub kind: ErrorKind,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    /// Up to two log lines either side of the offending line
    pub context: Option<String>,
}

impl CompilationError {
    /// An error that is not tied to any source position.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Fatal,
            file: None,
            line: None,
            column: None,
            context: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationWarning {
    pub message: String,
    pub kind: WarningKind,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub context: Option<String>,
}

impl std::fmt::Display for CompilationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{}:{}: {}", file, line, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::fmt::Display for CompilationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{}:{}: {}", file, line, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}
