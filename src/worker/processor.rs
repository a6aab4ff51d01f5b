use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::diagnostics::{CompilationError, LogParser};
use crate::error::{Result, TexschedError};
use crate::events::{CompilationStage, EventChannel};
use crate::scheduler::job::{CompilationJob, CompilationOptions, CompilationResult, JobId};
use crate::worker::runner::{ProcessRunner, RunOutput};

pub const SOURCE_FILE: &str = "document.tex";
pub const ARTIFACT_FILE: &str = "document.pdf";
pub const SYNC_MAP_FILE: &str = "document.synctex.gz";
const DEFAULT_OUTPUT_STEM: &str = "document";

const PREPARING_PERCENT: u8 = 10;
const COMPILING_BASE_PERCENT: u8 = 30;
const COMPILING_STEP_PERCENT: u8 = 20;
const PROCESSING_PERCENT: u8 = 80;

/// How a job left the processor.
#[derive(Debug)]
pub enum ProcessOutcome {
    Finished(CompilationResult),
    Cancelled,
}

/// Drives one job from source text to a [`CompilationResult`].
#[derive(Debug)]
pub struct JobProcessor {
    config: Arc<SchedulerConfig>,
    runner: ProcessRunner,
    parser: LogParser,
    events: EventChannel,
}

impl JobProcessor {
    pub fn new(config: Arc<SchedulerConfig>, events: EventChannel) -> Self {
        Self {
            runner: ProcessRunner::new(Duration::from_millis(config.cancel_grace_ms)),
            parser: LogParser::new(&config.rerun_patterns),
            config,
            events,
        }
    }

    /// Working directory used for `job_id`.
    pub fn work_dir(&self, job_id: JobId) -> PathBuf {
        self.config.temp_root.join(format!("job-{}", job_id))
    }

    /// Run the job to completion or cancellation. Never fails: every error is
    /// folded into the returned result.
    pub async fn process(&self, job: CompilationJob, cancel: CancellationToken) -> ProcessOutcome {
        let started = Instant::now();
        let work_dir = self.work_dir(job.id);

        tracing::info!(job_id = %job.id, compiler = %job.options.compiler, "Processing job");
        self.events.progress(
            job.id,
            CompilationStage::Preparing,
            PREPARING_PERCENT,
            "Preparing working directory",
        );

        let outcome = match self.prepare(&work_dir, &job.source).await {
            Ok(source_path) => {
                self.compile(&job, &work_dir, &source_path, &cancel, started)
                    .await
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to prepare job");
                ProcessOutcome::Finished(CompilationResult::fatal(
                    job.id,
                    format!("Failed to prepare job: {}", e),
                    elapsed_ms(started),
                ))
            }
        };

        spawn_cleanup(job.id, work_dir);
        outcome
    }

    async fn prepare(&self, work_dir: &Path, source: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(work_dir).await?;
        let source_path = work_dir.join(SOURCE_FILE);
        tokio::fs::write(&source_path, source).await?;
        Ok(source_path)
    }

    async fn compile(
        &self,
        job: &CompilationJob,
        work_dir: &Path,
        source_path: &Path,
        cancel: &CancellationToken,
        started: Instant,
    ) -> ProcessOutcome {
        let binary = self.config.compilers.get(job.options.compiler);
        let args = compiler_args(&job.options, work_dir, source_path);
        let timeout = Duration::from_millis(job.options.timeout_ms);
        let max_passes = self.config.max_passes.max(1);

        let mut passes = 0u32;
        let mut last: Option<RunOutput> = None;

        while passes < max_passes {
            if cancel.is_cancelled() {
                return ProcessOutcome::Cancelled;
            }
            let percent = COMPILING_BASE_PERCENT
                .saturating_add(COMPILING_STEP_PERCENT.saturating_mul(passes.min(255) as u8))
                .min(PROCESSING_PERCENT - 1);
            self.events.progress(
                job.id,
                CompilationStage::Compiling,
                percent,
                format!("Compiling (pass {} of at most {})", passes + 1, max_passes),
            );

            let output = match self
                .runner
                .run(binary, &args, work_dir, timeout, cancel)
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Compiler could not be run");
                    let mut result =
                        CompilationResult::fatal(job.id, e.to_string(), elapsed_ms(started));
                    result.passes = passes;
                    if let Some(previous) = last {
                        result.combined_log = previous.combined();
                    }
                    return ProcessOutcome::Finished(result);
                }
            };
            passes += 1;

            tracing::info!(
                job_id = %job.id,
                pass = passes,
                exit_code = ?output.exit_code,
                elapsed_ms = output.elapsed.as_millis() as u64,
                "Compiler pass finished"
            );

            if output.cancelled() {
                return ProcessOutcome::Cancelled;
            }
            let rerun = !output.timed_out()
                && passes < max_passes
                && self.parser.needs_another_pass(&output.combined());
            last = Some(output);
            if !rerun {
                break;
            }
            tracing::debug!(job_id = %job.id, pass = passes, "Log requests another pass");
        }

        if cancel.is_cancelled() {
            return ProcessOutcome::Cancelled;
        }
        let Some(last) = last else {
            return ProcessOutcome::Finished(CompilationResult::fatal(
                job.id,
                "Compiler was never run",
                elapsed_ms(started),
            ));
        };

        self.events.progress(
            job.id,
            CompilationStage::Processing,
            PROCESSING_PERCENT,
            "Collecting output",
        );
        ProcessOutcome::Finished(
            self.assemble(job, work_dir, last, passes, started).await,
        )
    }

    async fn assemble(
        &self,
        job: &CompilationJob,
        work_dir: &Path,
        last: RunOutput,
        passes: u32,
        started: Instant,
    ) -> CompilationResult {
        let mut combined_log = last.combined();
        let parsed = self.parser.parse(&combined_log);
        let mut errors = parsed.errors;
        let timed_out = last.timed_out();

        if timed_out {
            let timeout = TexschedError::Timeout {
                timeout_ms: job.options.timeout_ms,
            };
            if !combined_log.is_empty() && !combined_log.ends_with('\n') {
                combined_log.push('\n');
            }
            combined_log.push_str(&format!("[texsched] {}\n", timeout));
            errors.push(CompilationError::fatal(timeout.to_string()));
        }

        let artifact = if last.exit_clean() {
            match tokio::fs::read(work_dir.join(ARTIFACT_FILE)).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Compiler exited cleanly but produced no PDF");
                    errors.push(CompilationError::fatal(format!(
                        "No output file {} was produced",
                        ARTIFACT_FILE
                    )));
                    None
                }
            }
        } else {
            if !timed_out && errors.is_empty() {
                errors.push(CompilationError::fatal(match last.exit_code {
                    Some(code) => format!("Compiler exited with code {}", code),
                    None => "Compiler was terminated by a signal".to_string(),
                }));
            }
            None
        };

        let mut result = CompilationResult {
            job_id: job.id,
            success: artifact.is_some(),
            artifact_path: None,
            artifact_bytes: artifact,
            sync_map_path: None,
            combined_log,
            errors,
            warnings: parsed.warnings,
            duration_ms: 0,
            passes,
            timed_out,
        };

        if result.success {
            if let Some(output_dir) = &job.options.output_dir {
                if let Err(e) = self
                    .publish(work_dir, output_dir, &job.options, &mut result)
                    .await
                {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to copy output");
                    result.success = false;
                    result.artifact_bytes = None;
                    result.artifact_path = None;
                    result.sync_map_path = None;
                    result.errors.push(CompilationError::fatal(format!(
                        "Failed to write output to {}: {}",
                        output_dir.display(),
                        e
                    )));
                }
            }
        }

        result.duration_ms = elapsed_ms(started);
        result
    }

    /// Copy the artifact, and the sync map when requested, into `output_dir`
    /// as `<stem>.pdf` and `<stem>.synctex.gz`.
    async fn publish(
        &self,
        work_dir: &Path,
        output_dir: &Path,
        options: &CompilationOptions,
        result: &mut CompilationResult,
    ) -> Result<()> {
        let stem = options
            .output_stem
            .as_deref()
            .unwrap_or(DEFAULT_OUTPUT_STEM);
        tokio::fs::create_dir_all(output_dir).await?;
        let artifact_path = output_dir.join(format!("{}.pdf", stem));
        tokio::fs::copy(work_dir.join(ARTIFACT_FILE), &artifact_path).await?;
        result.artifact_path = Some(artifact_path);

        if options.enable_sync_map {
            let source = work_dir.join(SYNC_MAP_FILE);
            if tokio::fs::try_exists(&source).await.unwrap_or(false) {
                let target = output_dir.join(format!("{}.synctex.gz", stem));
                tokio::fs::copy(&source, &target).await?;
                result.sync_map_path = Some(target);
            }
        }
        Ok(())
    }
}

/// Command line for one pass, in the engine's expected order.
pub fn compiler_args(
    options: &CompilationOptions,
    work_dir: &Path,
    source_path: &Path,
) -> Vec<String> {
    let mut args = vec![
        "-interaction=nonstopmode".to_string(),
        "-file-line-error".to_string(),
        format!("-output-directory={}", work_dir.display()),
    ];
    if options.enable_sync_map {
        args.push("-synctex=1".to_string());
    }
    if options.allow_shell_escape {
        args.push("-shell-escape".to_string());
    }
    args.push(source_path.display().to_string());
    args
}

fn spawn_cleanup(job_id: JobId, work_dir: PathBuf) {
    tokio::spawn(async move {
        match tokio::fs::remove_dir_all(&work_dir).await {
            Ok(()) => tracing::debug!(job_id = %job_id, "Removed working directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                job_id = %job_id,
                dir = %work_dir.display(),
                error = %e,
                "Failed to remove working directory"
            ),
        }
    });
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}
