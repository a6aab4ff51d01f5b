use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TexschedError};

/// How long to keep reading pipes after the process is gone.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own
    Exited,
    /// The timer fired and the process was killed
    TimedOut,
    /// Cancellation was requested and the process was terminated
    Cancelled,
}

/// Output of a single process run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl RunOutput {
    /// Exited on its own with status 0.
    pub fn exit_clean(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }

    pub fn timed_out(&self) -> bool {
        self.termination == Termination::TimedOut
    }

    pub fn cancelled(&self) -> bool {
        self.termination == Termination::Cancelled
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let sep = if self.stdout.ends_with('\n') { "" } else { "\n" };
                format!("{}{}{}", self.stdout, sep, self.stderr)
            }
        }
    }
}

/// Runs one external process at a time, bounded by a timeout and a
/// cancellation token.
///
/// Children are placed in their own process group so that helpers they spawn
/// are signalled along with them.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    cancel_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl ProcessRunner {
    pub fn new(cancel_grace: Duration) -> Self {
        Self { cancel_grace }
    }

    /// Spawn `binary` with `args` in `cwd` and wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`TexschedError::Spawn`] if the binary cannot be started, or
    /// [`TexschedError::Io`] if waiting on it fails. Timeouts and cancellation
    /// are reported through [`RunOutput::termination`], not as errors.
    pub async fn run(
        &self,
        binary: &Path,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let started = tokio::time::Instant::now();

        let mut command = Command::new(binary);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| TexschedError::Spawn {
            binary: binary.display().to_string(),
            source,
        })?;
        tracing::debug!(binary = %binary.display(), pid = ?child.id(), ?args, "Spawned process");

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let mut stdout_task = tokio::spawn(pump(child.stdout.take(), stdout_buf.clone()));
        let mut stderr_task = tokio::spawn(pump(child.stderr.take(), stderr_buf.clone()));

        let (termination, status) = tokio::select! {
            status = child.wait() => (Termination::Exited, Some(status?)),
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    binary = %binary.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Process timed out, killing"
                );
                (Termination::TimedOut, self.kill(&mut child).await)
            }
            _ = cancel.cancelled() => {
                tracing::info!(binary = %binary.display(), "Cancellation requested, terminating process");
                (Termination::Cancelled, self.terminate(&mut child).await)
            }
        };

        finish_pump(&mut stdout_task).await;
        finish_pump(&mut stderr_task).await;

        Ok(RunOutput {
            termination,
            exit_code: status.and_then(|s| s.code()),
            stdout: take_text(&stdout_buf),
            stderr: take_text(&stderr_buf),
            elapsed: started.elapsed(),
        })
    }

    /// SIGTERM, then SIGKILL if the process outlives the grace period.
    async fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        signal_group(child, Signal::Terminate);
        match tokio::time::timeout(self.cancel_grace, child.wait()).await {
            Ok(status) => status.ok(),
            Err(_) => {
                tracing::warn!(pid = ?child.id(), "Process ignored SIGTERM, killing");
                self.kill(child).await
            }
        }
    }

    async fn kill(&self, child: &mut Child) -> Option<ExitStatus> {
        signal_group(child, Signal::Kill);
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "start_kill failed, process already gone");
        }
        child.wait().await.ok()
    }
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let signal = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own group, so -pid addresses the whole group.
    unsafe {
        libc::kill(-pid, signal);
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: Signal) {
    let _ = child.start_kill();
}

async fn pump<R>(reader: Option<R>, buf: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = buf.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

/// Let a pump reach EOF, but don't wait on pipes held open by stray descendants.
async fn finish_pump(task: &mut JoinHandle<()>) {
    if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut *task)
        .await
        .is_err()
    {
        task.abort();
    }
}

fn take_text(buf: &Mutex<Vec<u8>>) -> String {
    match buf.lock() {
        Ok(mut bytes) => String::from_utf8_lossy(&std::mem::take(&mut *bytes)).into_owned(),
        Err(_) => String::new(),
    }
}
