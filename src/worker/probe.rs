use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{CompilerChoice, CompilerPaths};
use crate::worker::runner::ProcessRunner;

/// Hard ceiling for a single version query.
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)+").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub available: bool,
    /// Usable compilers, in candidate order
    pub compilers: Vec<String>,
    /// Version reported by the first usable compiler
    pub version: Option<String>,
}

/// Checks which compiler binaries respond to a version query.
#[derive(Debug, Clone)]
pub struct CompilerProber {
    paths: CompilerPaths,
    candidates: Vec<CompilerChoice>,
    timeout: Duration,
    runner: ProcessRunner,
}

impl CompilerProber {
    pub fn new(paths: CompilerPaths, candidates: Vec<CompilerChoice>, timeout: Duration) -> Self {
        Self {
            paths,
            candidates,
            timeout: timeout.min(MAX_PROBE_TIMEOUT),
            runner: ProcessRunner::new(Duration::from_millis(200)),
        }
    }

    /// Probe every candidate concurrently. One failing candidate never
    /// prevents the others from being reported.
    pub async fn probe(&self) -> AvailabilityReport {
        let cwd = std::env::temp_dir();
        let mut set = JoinSet::new();

        for (index, choice) in self.candidates.iter().copied().enumerate() {
            let binary = self.paths.get(choice).to_path_buf();
            let runner = self.runner.clone();
            let timeout = self.timeout;
            let cwd = cwd.clone();
            set.spawn(async move {
                let args = vec!["--version".to_string()];
                let outcome = runner
                    .run(&binary, &args, &cwd, timeout, &CancellationToken::new())
                    .await;
                let output = match outcome {
                    Ok(output) if output.exit_clean() => Some(output.combined()),
                    Ok(output) => {
                        tracing::warn!(
                            compiler = %choice,
                            exit_code = ?output.exit_code,
                            timed_out = output.timed_out(),
                            "Compiler probe failed"
                        );
                        None
                    }
                    Err(e) => {
                        tracing::warn!(compiler = %choice, error = %e, "Compiler not available");
                        None
                    }
                };
                (index, choice, output)
            });
        }

        let mut responses = Vec::with_capacity(self.candidates.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, choice, Some(output))) => responses.push((index, choice, output)),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Compiler probe task failed"),
            }
        }
        responses.sort_by_key(|(index, _, _)| *index);

        let version = responses
            .first()
            .and_then(|(_, _, output)| extract_version(output));
        let report = AvailabilityReport {
            available: !responses.is_empty(),
            compilers: responses
                .into_iter()
                .map(|(_, choice, _)| choice.to_string())
                .collect(),
            version,
        };
        tracing::info!(
            available = report.available,
            compilers = ?report.compilers,
            version = ?report.version,
            "Compiler probe finished"
        );
        report
    }
}

/// First dotted numeric run in the output, e.g. `3.141592653`.
pub fn extract_version(output: &str) -> Option<String> {
    VERSION_PATTERN
        .find(output)
        .map(|m| m.as_str().to_string())
}
