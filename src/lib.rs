pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use config::{CompilerChoice, CompilerPaths, SchedulerConfig};
pub use diagnostics::{CompilationError, CompilationWarning, ErrorKind, LogParser, WarningKind};
pub use error::{Result, TexschedError};
pub use events::{CompilationProgress, CompilationStage, SchedulerEvent};
pub use scheduler::{
    CompilationOptions, CompilationResult, CompileScheduler, JobId, JobOutcome, SchedulerStatus,
};
pub use worker::AvailabilityReport;
