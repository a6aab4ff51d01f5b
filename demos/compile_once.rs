use clap::Parser;
use tokio_stream::StreamExt;

use texsched::config::SchedulerConfig;
use texsched::events::SchedulerEvent;
use texsched::scheduler::{CompilationOptions, CompileScheduler};

const SAMPLE: &str = r"\documentclass{article}
\begin{document}
See section~\ref{sec:intro}.
\section{Introduction}\label{sec:intro}
Hello from texsched.
\end{document}
";

#[derive(Parser, Debug)]
#[command(name = "compile-once")]
#[command(about = "Compile a small sample document and print every event")]
struct Args {
    /// Directory to copy the PDF into
    #[arg(long, default_value = "texsched-out")]
    output_dir: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let scheduler = CompileScheduler::new(SchedulerConfig::default());

    let report = scheduler.probe_availability().await;
    if !report.available {
        eprintln!("No LaTeX compiler found on PATH");
        return Ok(());
    }
    println!(
        "Using {} (version {})",
        report.compilers.join(", "),
        report.version.as_deref().unwrap_or("unknown")
    );

    let mut events = Box::pin(scheduler.event_stream());
    let job_id = scheduler.submit(
        SAMPLE,
        CompilationOptions::default().with_output_dir(&args.output_dir),
    );

    while let Some(event) = events.next().await {
        if event.job_id() != job_id {
            continue;
        }
        match &event {
            SchedulerEvent::Progress(p) => println!("[{:>3}%] {:<10} {}", p.percent, p.stage, p.message),
            SchedulerEvent::Completed(result) => {
                println!(
                    "success={} passes={} errors={} warnings={} pdf={:?}",
                    result.success,
                    result.passes,
                    result.errors.len(),
                    result.warnings.len(),
                    result.artifact_path
                );
            }
            SchedulerEvent::Cancelled { .. } => println!("cancelled"),
        }
        if event.is_final() {
            break;
        }
    }

    scheduler.shutdown().await?;
    Ok(())
}
