use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CompilerChoice;
use crate::diagnostics::{CompilationError, CompilationWarning};

pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Opaque job identifier.
///
/// Backed by a UUIDv7, so ids sort roughly by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationOptions {
    pub compiler: CompilerChoice,
    pub timeout_ms: u64,
    pub allow_shell_escape: bool,
    /// Ask the engine for a SyncTeX position map
    pub enable_sync_map: bool,
    /// Copy the artifact (and sync map) here on success
    pub output_dir: Option<PathBuf>,
    /// File name stem for the copies in `output_dir` (default `document`)
    #[serde(default)]
    pub output_stem: Option<String>,
}

impl Default for CompilationOptions {
    fn default() -> Self {
        Self {
            compiler: CompilerChoice::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            allow_shell_escape: false,
            enable_sync_map: true,
            output_dir: None,
            output_stem: None,
        }
    }
}

impl CompilationOptions {
    /// Replace values that cannot be honored with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.timeout_ms == 0 {
            self.timeout_ms = DEFAULT_TIMEOUT_MS;
        }
        if self
            .output_dir
            .as_ref()
            .is_some_and(|dir| dir.as_os_str().is_empty())
        {
            self.output_dir = None;
        }
        if self
            .output_stem
            .as_ref()
            .is_some_and(|stem| stem.trim().is_empty())
        {
            self.output_stem = None;
        }
        self
    }

    pub fn with_compiler(mut self, compiler: CompilerChoice) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_output_stem(mut self, stem: impl Into<String>) -> Self {
        self.output_stem = Some(stem.into());
        self
    }
}

/// One request to compile `source`. Immutable once created.
#[derive(Debug, Clone)]
pub struct CompilationJob {
    pub id: JobId,
    pub source: String,
    pub options: CompilationOptions,
    /// Higher is served first
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    /// Submission sequence number, breaks timestamp ties
    pub(crate) seq: u64,
}

impl CompilationJob {
    pub fn new(source: String, options: CompilationOptions, priority: i32, seq: u64) -> Self {
        Self {
            id: JobId::new(),
            source,
            options: options.normalized(),
            priority,
            submitted_at: Utc::now(),
            seq,
        }
    }
}

/// The single outcome of a job that was not cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationResult {
    pub job_id: JobId,
    pub success: bool,
    /// Set on success when an output directory was requested
    pub artifact_path: Option<PathBuf>,
    /// The rendered PDF, present only on success
    #[serde(skip)]
    pub artifact_bytes: Option<Vec<u8>>,
    pub sync_map_path: Option<PathBuf>,
    pub combined_log: String,
    pub errors: Vec<CompilationError>,
    pub warnings: Vec<CompilationWarning>,
    pub duration_ms: u64,
    /// Number of compiler invocations performed
    pub passes: u32,
    pub timed_out: bool,
}

impl CompilationResult {
    /// A failed result carrying one fatal error and no compiler output.
    pub fn fatal(job_id: JobId, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            job_id,
            success: false,
            artifact_path: None,
            artifact_bytes: None,
            sync_map_path: None,
            combined_log: String::new(),
            errors: vec![CompilationError::fatal(message)],
            warnings: Vec::new(),
            duration_ms,
            passes: 0,
            timed_out: false,
        }
    }
}
