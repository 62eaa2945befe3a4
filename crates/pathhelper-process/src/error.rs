//! Error types for process execution

use std::fmt;
use std::io;
use std::process::ExitStatus;

use thiserror::Error;

/// Lifecycle state of a [`Process`](crate::Process)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Configured but not started yet
    Created,
    /// Spawned and not yet reaped
    Running,
    /// Exited and reaped
    Finished,
    /// The OS refused to spawn the program
    SpawnFailed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "not started",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::SpawnFailed => "failed to spawn",
        })
    }
}

/// How a started process ended when it did not exit cleanly
///
/// The textual form is stable so callers can script against it:
/// `exit status 3`, `signal: killed`, `signal: terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with a non-zero code
    ExitCode(i32),
    /// Forcefully terminated (`SIGKILL`, or a tree kill on Windows)
    Killed,
    /// Terminated by any other signal (Unix only)
    Signal(i32),
}

impl Termination {
    /// Classify an exit status, `None` for a clean exit.
    ///
    /// `killed` tells whether this process was the target of a tree kill;
    /// Windows has no signals, so a kill is only recognisable by its exit code.
    pub fn from_status(status: ExitStatus, killed: bool) -> Option<Self> {
        if status.success() {
            return None;
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;

            if let Some(signal) = status.signal() {
                return Some(if signal == nix::sys::signal::Signal::SIGKILL as i32 {
                    Self::Killed
                } else {
                    Self::Signal(signal)
                });
            }
        }

        let code = status.code().unwrap_or(-1);
        if cfg!(windows) && killed && code == crate::tree::KILL_EXIT_CODE as i32 {
            return Some(Self::Killed);
        }
        Some(Self::ExitCode(code))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitCode(code) => write!(f, "exit status {code}"),
            Self::Killed => f.write_str("signal: killed"),
            Self::Signal(signal) => write!(f, "signal: {}", signal_name(*signal)),
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    use nix::sys::signal::Signal;

    match Signal::try_from(signal) {
        Ok(Signal::SIGHUP) => "hangup".to_string(),
        Ok(Signal::SIGINT) => "interrupt".to_string(),
        Ok(Signal::SIGQUIT) => "quit".to_string(),
        Ok(Signal::SIGABRT) => "aborted".to_string(),
        Ok(Signal::SIGSEGV) => "segmentation fault".to_string(),
        Ok(Signal::SIGPIPE) => "broken pipe".to_string(),
        Ok(Signal::SIGALRM) => "alarm clock".to_string(),
        Ok(Signal::SIGTERM) => "terminated".to_string(),
        Ok(Signal::SIGUSR1) => "user defined signal 1".to_string(),
        Ok(Signal::SIGUSR2) => "user defined signal 2".to_string(),
        Ok(other) => other.as_str().to_string(),
        Err(_) => signal.to_string(),
    }
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    signal.to_string()
}

/// Process execution errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Invalid setup: empty program, empty pipe chain, bad config file
    #[error("invalid process configuration: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the current lifecycle state
    #[error("cannot {operation}: process is {state}")]
    InvalidState {
        operation: &'static str,
        state: ProcessState,
    },

    /// The OS refused to create the process
    #[error("failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The process ran but did not exit cleanly
    #[error("{0}")]
    Terminated(Termination),

    /// The process was killed because its cancellation signal fired
    #[error("{0}")]
    Cancelled(Termination),

    /// The tree-kill primitive itself failed
    #[error("failed to kill process {pid}: {source}")]
    KillFailed {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// Waiting on the child or forwarding one of its streams failed
    #[error("process I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    /// Termination carried by this error, whether organic or cancelled
    pub fn termination(&self) -> Option<Termination> {
        match self {
            Self::Terminated(termination) | Self::Cancelled(termination) => Some(*termination),
            _ => None,
        }
    }

    /// True when the supervisor stopped the process
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
