//! Cancellation-bounded execution
//!
//! Races a process's exit against a cancellation future. When cancellation
//! wins, the whole process tree is killed and the process is still reaped
//! before returning.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{ProcessError, Result, Termination},
    process::{KillReach, Process},
    stdio::{CaptureBuffer, Output},
};

enum Race {
    Exited(Result<()>),
    Cancelled,
}

/// Outcome of [`Process::run_and_capture_output`]
///
/// The captured streams are returned whatever the outcome, including on
/// cancellation. Both buffers grow without bound with the process output.
#[derive(Debug)]
pub struct CapturedOutput {
    /// Everything written to stdout
    pub stdout: Vec<u8>,
    /// Everything written to stderr
    pub stderr: Vec<u8>,
    /// Same outcome as [`Process::run_within`]
    pub result: Result<()>,
}

impl CapturedOutput {
    /// Drop the streams on failure
    pub fn into_result(self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.result.map(|()| (self.stdout, self.stderr))
    }
}

impl Process {
    /// Start the process and wait for it unless `cancel` completes first
    ///
    /// If `cancel` wins, the process tree is killed, reaped, and
    /// [`ProcessError::Cancelled`] is returned. If the process exits first,
    /// `cancel` is dropped without effect.
    ///
    /// # Examples
    /// ```no_run
    /// use std::time::Duration;
    /// use pathhelper_process::Process;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut process = Process::new("arduino-cli", ["compile", "sketch"])?;
    /// process.run_within(tokio::time::sleep(Duration::from_secs(60))).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_within<F>(&mut self, cancel: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start()?;

        let race = tokio::select! {
            // an exit that is already observable beats a cancellation
            biased;
            exited = self.wait() => Race::Exited(exited),
            () = cancel => Race::Cancelled,
        };

        match race {
            Race::Exited(result) => result,
            Race::Cancelled => {
                debug!(pid = ?self.pid(), program = %self.program(), "Cancelled, killing process tree");
                let reach = match self.kill_tree() {
                    Ok(reach) => reach,
                    Err(e) => {
                        warn!(pid = ?self.pid(), error = %e, "Failed to kill cancelled process");
                        return Err(e);
                    }
                };
                match (self.wait().await, reach) {
                    // exited on its own and left nothing behind
                    (outcome, KillReach::Nothing) => outcome,
                    (Err(ProcessError::Terminated(termination)), _) => {
                        Err(ProcessError::Cancelled(termination))
                    }
                    // the process itself exited cleanly, what it left running did not
                    (Ok(()), KillReach::Leftovers) => {
                        Err(ProcessError::Cancelled(Termination::Killed))
                    }
                    // exited cleanly right before the kill landed
                    (other, _) => other,
                }
            }
        }
    }

    /// [`run_within`](Self::run_within) with a deadline
    pub async fn run_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.run_within(tokio::time::sleep(timeout)).await
    }

    /// [`run_within`](Self::run_within) bound to a cancellation token
    pub async fn run_until_cancelled(&mut self, token: &CancellationToken) -> Result<()> {
        self.run_within(token.cancelled()).await
    }

    /// Run with stdout and stderr captured in memory
    ///
    /// Replaces any stdout/stderr routing configured before. The captured
    /// bytes are returned alongside the outcome of
    /// [`run_within`](Self::run_within).
    pub async fn run_and_capture_output<F>(&mut self, cancel: F) -> CapturedOutput
    where
        F: Future<Output = ()>,
    {
        let stdout = CaptureBuffer::new();
        let stderr = CaptureBuffer::new();

        let result = match self
            .redirect_stdout(Output::Capture(stdout.clone()))
            .and_then(|()| self.redirect_stderr(Output::Capture(stderr.clone())))
        {
            Ok(()) => self.run_within(cancel).await,
            Err(e) => Err(e),
        };

        CapturedOutput {
            stdout: stdout.take(),
            stderr: stderr.take(),
            result,
        }
    }
}
