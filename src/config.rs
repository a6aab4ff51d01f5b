use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Substrings that mean another compiler pass would change the output.
pub const DEFAULT_RERUN_PATTERNS: &[&str] = &[
    "Rerun to get cross-references right",
    "undefined references",
    "Label(s) may have changed",
];

/// The compiler binaries a job can be compiled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerChoice {
    #[default]
    Pdflatex,
    Xelatex,
    Lualatex,
}

impl CompilerChoice {
    pub const ALL: [CompilerChoice; 3] = [
        CompilerChoice::Pdflatex,
        CompilerChoice::Xelatex,
        CompilerChoice::Lualatex,
    ];

    pub fn binary_name(&self) -> &'static str {
        match self {
            CompilerChoice::Pdflatex => "pdflatex",
            CompilerChoice::Xelatex => "xelatex",
            CompilerChoice::Lualatex => "lualatex",
        }
    }
}

impl std::fmt::Display for CompilerChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.binary_name())
    }
}

/// Where each compiler binary lives.
///
/// Defaults to bare binary names, which are resolved through `PATH` at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerPaths {
    pub pdflatex: PathBuf,
    pub xelatex: PathBuf,
    pub lualatex: PathBuf,
}

impl Default for CompilerPaths {
    fn default() -> Self {
        Self {
            pdflatex: PathBuf::from("pdflatex"),
            xelatex: PathBuf::from("xelatex"),
            lualatex: PathBuf::from("lualatex"),
        }
    }
}

impl CompilerPaths {
    /// Point every compiler choice at the same binary.
    pub fn uniform(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            pdflatex: path.clone(),
            xelatex: path.clone(),
            lualatex: path,
        }
    }

    pub fn get(&self, choice: CompilerChoice) -> &Path {
        match choice {
            CompilerChoice::Pdflatex => &self.pdflatex,
            CompilerChoice::Xelatex => &self.xelatex,
            CompilerChoice::Lualatex => &self.lualatex,
        }
    }

    pub fn set(&mut self, choice: CompilerChoice, path: impl Into<PathBuf>) {
        let slot = match choice {
            CompilerChoice::Pdflatex => &mut self.pdflatex,
            CompilerChoice::Xelatex => &mut self.xelatex,
            CompilerChoice::Lualatex => &mut self.lualatex,
        };
        *slot = path.into();
    }
}

/// Configuration for a [`CompileScheduler`](crate::scheduler::CompileScheduler) instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of jobs compiling at the same time
    pub max_concurrent: usize,
    /// Parent directory for per-job working directories
    pub temp_root: PathBuf,
    /// Upper bound on compiler invocations per job
    pub max_passes: u32,
    /// Compiler binary locations
    pub compilers: CompilerPaths,
    /// Compilers checked by availability probing, in reporting order
    pub probe_candidates: Vec<CompilerChoice>,
    /// Timeout for a single `--version` probe
    pub probe_timeout_ms: u64,
    /// Log substrings that request another pass
    pub rerun_patterns: Vec<String>,
    /// Buffered events per subscriber before old ones are dropped
    pub event_capacity: usize,
    /// How long a cancelled compiler gets to exit after SIGTERM before it is killed
    pub cancel_grace_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            temp_root: std::env::temp_dir().join("texsched"),
            max_passes: 3,
            compilers: CompilerPaths::default(),
            probe_candidates: CompilerChoice::ALL.to_vec(),
            probe_timeout_ms: 5_000,
            rerun_patterns: DEFAULT_RERUN_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            event_capacity: 256,
            cancel_grace_ms: 2_000,
        }
    }
}

impl SchedulerConfig {
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
            ..Default::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_compilers(mut self, compilers: CompilerPaths) -> Self {
        self.compilers = compilers;
        self
    }

    pub fn with_compiler(mut self, choice: CompilerChoice, path: impl Into<PathBuf>) -> Self {
        self.compilers.set(choice, path);
        self
    }

    pub fn with_rerun_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rerun_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }
}
