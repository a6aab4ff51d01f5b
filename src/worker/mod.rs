//! Compilation engine: everything that touches external compiler processes.
//!
//! - **Process runner**: spawns one compiler invocation, captures its output
//!   and enforces the timeout and cancellation
//! - **Job processor**: runs up to `max_passes` invocations for a job in its
//!   own working directory and assembles the [`CompilationResult`]
//! - **Prober**: asks each configured compiler for its version
//!
//! # Components
//!
//! - [`ProcessRunner`]: one process, bounded by a timer and a cancellation token
//! - [`JobProcessor`]: prepare → compile passes → collect → assemble → cleanup
//! - [`CompilerProber`]: availability report for the configured binaries
//!
//! # Execution Flow
//!
//! 1. The scheduler hands a job and a cancellation token to [`JobProcessor::process`]
//! 2. The source is written to `<temp_root>/job-<id>/document.tex`
//! 3. The compiler runs until the log stops asking for a rerun or passes run out
//! 4. The PDF is read back and the last log is parsed into diagnostics
//! 5. The working directory is removed in the background
//!
//! [`CompilationResult`]: crate::scheduler::job::CompilationResult

pub mod probe;
pub mod processor;
pub mod runner;

pub use probe::{AvailabilityReport, CompilerProber};
pub use processor::{JobProcessor, ProcessOutcome};
pub use runner::{ProcessRunner, RunOutput, Termination};
