//! Shell-style pipelines
//!
//! Connects processes stdout -> stdin like `a | b | c`. Each adjacent pair
//! shares one OS pipe: the producer's stdout pipe is handed to the consumer as
//! its stdin, so the consumer sees end-of-input exactly when the producer has
//! exited and its end of the pipe is closed.

use std::process::Stdio;

use tokio::process::ChildStdout;
use tracing::debug;

use crate::{
    error::{ProcessError, ProcessState, Result},
    process::Process,
    stdio::{CaptureBuffer, Input, Output},
};

/// Output of a finished [`PipeChain`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipeOutput {
    /// stdout of the last stage
    pub stdout: Vec<u8>,
    /// stderr of every stage, interleaved as written
    pub stderr: Vec<u8>,
}

/// An ordered, non-empty sequence of processes to run as a pipeline
#[derive(Debug)]
pub struct PipeChain {
    stages: Vec<Process>,
}

impl PipeChain {
    /// Build a chain; an empty chain is a configuration error
    pub fn new(stages: Vec<Process>) -> Result<Self> {
        if stages.is_empty() {
            return Err(ProcessError::InvalidConfig(
                "pipe chain needs at least one process".to_string(),
            ));
        }
        Ok(Self { stages })
    }

    /// Stages in pipeline order
    pub fn stages(&self) -> &[Process] {
        &self.stages
    }

    /// Start every stage in order and wait for all of them
    ///
    /// The first stage may already have been started by the caller, provided
    /// its stdout is [`Output::Piped`]. Every other stage must be fresh.
    ///
    /// The first error from any start or wait is returned right away; stages
    /// that were already running are reaped in the background.
    pub async fn run(self) -> Result<PipeOutput> {
        let output = CaptureBuffer::new();
        let errors = CaptureBuffer::new();
        let last = self.stages.len() - 1;

        let mut started: Vec<Process> = Vec::with_capacity(self.stages.len());
        let mut upstream: Option<ChildStdout> = None;

        for (index, mut stage) in self.stages.into_iter().enumerate() {
            if let Err(e) = connect(&mut stage, index, last, upstream.take(), &output, &errors) {
                reap_in_background(started);
                return Err(e);
            }
            let next_input = if index == last {
                None
            } else {
                stage.take_stdout()
            };
            started.push(stage);

            if index != last {
                match next_input {
                    Some(pipe) => upstream = Some(pipe),
                    None => {
                        reap_in_background(started);
                        return Err(ProcessError::InvalidConfig(format!(
                            "pipe stage {index} has no piped stdout to feed the next stage"
                        )));
                    }
                }
            }
        }

        let mut remaining = started.into_iter().enumerate();
        while let Some((index, mut stage)) = remaining.next() {
            if let Err(e) = stage.wait().await {
                debug!(stage = index, program = %stage.program(), error = %e, "Pipe stage failed");
                reap_in_background(remaining.map(|(_, stage)| stage).collect());
                return Err(e);
            }
        }

        Ok(PipeOutput {
            stdout: output.take(),
            stderr: errors.take(),
        })
    }
}

/// Run `stages` as a pipeline and return the last stage's stdout
///
/// # Examples
/// ```no_run
/// use pathhelper_process::{pipe_commands, Process};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let listing = pipe_commands(vec![
///     Process::new("ls", ["-1"])?,
///     Process::new("sort", ["-r"])?,
/// ])
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn pipe_commands(stages: Vec<Process>) -> Result<Vec<u8>> {
    let output = PipeChain::new(stages)?.run().await?;
    Ok(output.stdout)
}

fn connect(
    stage: &mut Process,
    index: usize,
    last: usize,
    upstream: Option<ChildStdout>,
    output: &CaptureBuffer,
    errors: &CaptureBuffer,
) -> Result<()> {
    if stage.state() != ProcessState::Created {
        if index == 0 {
            return Ok(());
        }
        return Err(ProcessError::InvalidConfig(format!(
            "pipe stage {index} was already started; only the first stage may be"
        )));
    }

    if let Some(pipe) = upstream {
        let stdin: Stdio = pipe.try_into()?;
        stage.redirect_stdin(Input::Stdio(stdin))?;
    }
    stage.redirect_stdout(if index == last {
        Output::Capture(output.clone())
    } else {
        Output::Piped
    })?;
    stage.redirect_stderr(Output::Capture(errors.clone()))?;

    debug!(stage = index, program = %stage.program(), "Starting pipe stage");
    stage.start()
}

/// Reap started stages nobody is waiting on anymore
fn reap_in_background(stages: Vec<Process>) {
    if stages.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for mut stage in stages {
            if let Err(e) = stage.wait().await {
                debug!(program = %stage.program(), error = %e, "Abandoned pipe stage finished");
            }
        }
    });
}
