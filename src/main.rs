use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use texsched::config::{CompilerChoice, CompilerPaths, SchedulerConfig};
use texsched::scheduler::{
    CompilationOptions, CompilationResult, CompileScheduler, JobId, JobOutcome,
};
use texsched::shutdown::install_shutdown_handler;
use texsched::worker::AvailabilityReport;

#[derive(Parser, Debug)]
#[command(name = "texsched")]
#[command(version)]
#[command(about = "Compile LaTeX documents through a bounded job scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    scheduler: SchedulerArgs,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Compile one or more .tex files
    Compile(CompileArgs),

    /// Report which compilers are installed
    Probe,
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SchedulerArgs {
    /// Maximum number of compilers running at once
    #[arg(long, global = true, default_value = "2")]
    max_concurrent: usize,

    /// Directory for per-job working directories (default: system temp dir)
    #[arg(long, global = true)]
    temp_root: Option<PathBuf>,

    /// Maximum compiler passes per document
    #[arg(long, global = true, default_value = "3")]
    max_passes: u32,

    /// Path to pdflatex
    #[arg(long, global = true)]
    pdflatex: Option<PathBuf>,

    /// Path to xelatex
    #[arg(long, global = true)]
    xelatex: Option<PathBuf>,

    /// Path to lualatex
    #[arg(long, global = true)]
    lualatex: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct CompileArgs {
    /// Source files to compile
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Compiler to use
    #[arg(long, short = 'c', default_value = "pdflatex")]
    compiler: CompilerArg,

    /// Per-pass timeout in milliseconds
    #[arg(long, default_value = "60000")]
    timeout_ms: u64,

    /// Scheduling priority (higher runs first)
    #[arg(long, default_value = "0")]
    priority: i32,

    /// Allow \write18 shell escape
    #[arg(long)]
    shell_escape: bool,

    /// Don't produce a SyncTeX map
    #[arg(long)]
    no_synctex: bool,

    /// Where to write PDFs (default: next to each source file)
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CompilerArg {
    Pdflatex,
    Xelatex,
    Lualatex,
}

impl From<CompilerArg> for CompilerChoice {
    fn from(arg: CompilerArg) -> Self {
        match arg {
            CompilerArg::Pdflatex => CompilerChoice::Pdflatex,
            CompilerArg::Xelatex => CompilerChoice::Xelatex,
            CompilerArg::Lualatex => CompilerChoice::Lualatex,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct CompileReport {
    file: PathBuf,
    job_id: JobId,
    status: &'static str,
    pdf: Option<PathBuf>,
    sync_map: Option<PathBuf>,
    result: Option<CompilationResult>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn build_config(args: &SchedulerArgs) -> SchedulerConfig {
    let mut compilers = CompilerPaths::default();
    for (choice, path) in [
        (CompilerChoice::Pdflatex, &args.pdflatex),
        (CompilerChoice::Xelatex, &args.xelatex),
        (CompilerChoice::Lualatex, &args.lualatex),
    ] {
        if let Some(path) = path {
            compilers.set(choice, path);
        }
    }

    let mut config = SchedulerConfig::default()
        .with_max_concurrent(args.max_concurrent)
        .with_compilers(compilers);
    config.max_passes = args.max_passes.max(1);
    if let Some(temp_root) = &args.temp_root {
        config.temp_root = temp_root.clone();
    }
    config
}

/// Events one job can emit: queued, preparing, one per pass, processing,
/// the terminal progress event and the final event.
fn event_capacity_for(files: usize, max_passes: u32) -> usize {
    let per_job = 5 + max_passes as usize;
    SchedulerConfig::default()
        .event_capacity
        .max(files.saturating_mul(per_job))
}

/// Directory and file stem the PDF for `source` is written under.
fn output_target(source: &Path, output_dir: Option<&Path>) -> (PathBuf, String) {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| {
            source
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
        .unwrap_or_else(|| PathBuf::from("."));
    (dir, stem)
}

fn print_result_table(file: &Path, result: &CompilationResult) {
    let status = if result.success { "OK" } else { "FAILED" };
    println!(
        "{:<8} {} ({} pass(es), {} ms, {} error(s), {} warning(s))",
        status,
        file.display(),
        result.passes,
        result.duration_ms,
        result.errors.len(),
        result.warnings.len()
    );
    if let Some(pdf) = &result.artifact_path {
        println!("         -> {}", pdf.display());
    }
    if let Some(sync_map) = &result.sync_map_path {
        println!("         -> {}", sync_map.display());
    }
    for error in &result.errors {
        println!("  error:   {}", error);
    }
    for warning in &result.warnings {
        println!("  warning: {}", warning);
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_compile(
    scheduler: &CompileScheduler,
    args: CompileArgs,
    output_format: &OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let options = CompilationOptions {
        compiler: args.compiler.into(),
        timeout_ms: args.timeout_ms,
        allow_shell_escape: args.shell_escape,
        enable_sync_map: !args.no_synctex,
        output_dir: None,
        output_stem: None,
    };

    let shutdown = install_shutdown_handler();

    // Subscribe before submitting so no event is missed
    let mut events = scheduler.subscribe();
    let mut jobs: Vec<(JobId, PathBuf)> = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let source = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
        let (dir, stem) = output_target(file, args.output_dir.as_deref());
        let options = options.clone().with_output_dir(dir).with_output_stem(stem);
        let job_id = scheduler.submit_with_priority(source, options, args.priority);
        tracing::info!(job_id = %job_id, file = %file.display(), "Submitted");
        jobs.push((job_id, file.clone()));
    }

    let ids: Vec<JobId> = jobs.iter().map(|(job_id, _)| *job_id).collect();
    let mut outcomes = scheduler.wait_for_jobs(&mut events, &ids, &shutdown).await;

    let mut ordered = Vec::with_capacity(jobs.len());
    for (job_id, file) in jobs {
        let outcome = outcomes.remove(&job_id).unwrap_or(JobOutcome::Lost);
        let status = outcome.label();
        let result = match outcome {
            JobOutcome::Completed(mut result) => {
                // Already written to disk
                result.artifact_bytes = None;
                Some(*result)
            }
            JobOutcome::Cancelled | JobOutcome::Lost => None,
        };
        ordered.push(CompileReport {
            file,
            job_id,
            status,
            pdf: result.as_ref().and_then(|r| r.artifact_path.clone()),
            sync_map: result.as_ref().and_then(|r| r.sync_map_path.clone()),
            result,
        });
    }

    let all_ok = ordered.iter().all(|report| report.status == "completed");

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&ordered)?);
        }
        OutputFormat::Table => {
            for report in &ordered {
                match &report.result {
                    Some(result) => print_result_table(&report.file, result),
                    None => println!(
                        "{:<8} {}",
                        report.status.to_uppercase(),
                        report.file.display()
                    ),
                }
            }
        }
    }

    Ok(all_ok)
}

async fn handle_probe(
    scheduler: &CompileScheduler,
    output_format: &OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let report: AvailabilityReport = scheduler.probe_availability().await;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            if report.available {
                println!("Available compilers: {}", report.compilers.join(", "));
                println!(
                    "Version: {}",
                    report.version.as_deref().unwrap_or("unknown")
                );
            } else {
                println!("No LaTeX compiler found");
            }
        }
    }

    Ok(report.available)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = build_config(&args.scheduler);
    if let Commands::Compile(compile_args) = &args.command {
        config.event_capacity = event_capacity_for(compile_args.files.len(), config.max_passes);
    }
    let scheduler = CompileScheduler::new(config);

    let ok = match args.command {
        Commands::Compile(compile_args) => {
            handle_compile(&scheduler, compile_args, &args.output).await?
        }
        Commands::Probe => handle_probe(&scheduler, &args.output).await?,
    };

    if let Err(e) = scheduler.shutdown().await {
        tracing::debug!(error = %e, "Scheduler already stopped");
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_lands_next_to_source_by_default() {
        assert_eq!(
            output_target(Path::new("papers/thesis.tex"), None),
            (PathBuf::from("papers"), "thesis".to_string())
        );
        assert_eq!(
            output_target(Path::new("thesis.tex"), None),
            (PathBuf::from("."), "thesis".to_string())
        );
    }

    #[test]
    fn output_respects_output_dir() {
        assert_eq!(
            output_target(Path::new("papers/thesis.tex"), Some(Path::new("out"))),
            (PathBuf::from("out"), "thesis".to_string())
        );
    }

    #[test]
    fn output_dir_and_stem_reach_compilation_options() {
        let args = Args::parse_from([
            "texsched",
            "compile",
            "papers/thesis.tex",
            "--output-dir",
            "build",
        ]);
        let Commands::Compile(compile) = args.command else {
            panic!("expected compile");
        };
        let (dir, stem) = output_target(&compile.files[0], compile.output_dir.as_deref());
        let options = CompilationOptions::default()
            .with_output_dir(dir)
            .with_output_stem(stem)
            .normalized();
        assert_eq!(options.output_dir, Some(PathBuf::from("build")));
        assert_eq!(options.output_stem.as_deref(), Some("thesis"));
        assert!(options.enable_sync_map);
    }

    #[test]
    fn event_capacity_grows_with_batch_size() {
        let default = SchedulerConfig::default().event_capacity;
        assert_eq!(event_capacity_for(1, 3), default);
        assert_eq!(event_capacity_for(3000, 3), 3000 * 8);
    }

    #[test]
    fn compiler_paths_from_flags() {
        let args = Args::parse_from([
            "texsched",
            "--max-concurrent",
            "4",
            "--xelatex",
            "/opt/tex/bin/xelatex",
            "probe",
        ]);
        let config = build_config(&args.scheduler);
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(
            config.compilers.get(CompilerChoice::Xelatex),
            Path::new("/opt/tex/bin/xelatex")
        );
        assert_eq!(
            config.compilers.get(CompilerChoice::Pdflatex),
            Path::new("pdflatex")
        );
    }

    #[test]
    fn compile_args_parse() {
        let args = Args::parse_from([
            "texsched",
            "compile",
            "a.tex",
            "b.tex",
            "--compiler",
            "lualatex",
            "--priority",
            "5",
            "--no-synctex",
        ]);
        match args.command {
            Commands::Compile(compile) => {
                assert_eq!(compile.files.len(), 2);
                assert_eq!(CompilerChoice::from(compile.compiler), CompilerChoice::Lualatex);
                assert_eq!(compile.priority, 5);
                assert!(compile.no_synctex);
                assert!(!compile.shell_escape);
            }
            Commands::Probe => panic!("expected compile"),
        }
    }
}
