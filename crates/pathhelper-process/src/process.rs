//! Managed external program invocation

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, info, warn};

use crate::{
    config::ProcessConfig,
    error::{ProcessError, ProcessState, Result, Termination},
    stdio::{self, Forwarder, Input, Output},
    tree::{self, ProcessTreeController},
};

#[derive(Debug)]
enum State {
    Created,
    Running {
        child: Child,
        pid: u32,
        /// Copy tasks still to be joined
        forwarders: Vec<Forwarder>,
        forward_error: Option<io::Error>,
    },
    Finished {
        pid: u32,
        status: ExitStatus,
        termination: Option<Termination>,
        forward_error: Option<(io::ErrorKind, String)>,
    },
    SpawnFailed {
        error: io::Error,
    },
}

/// What a tree kill found to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KillReach {
    /// The process itself was still running
    Process,
    /// The process had exited; descendants it left behind were killed
    Leftovers,
    /// Nothing was running anymore
    Nothing,
}

/// Pipe ends left to the caller for streams configured as piped
#[derive(Debug, Default)]
struct Pipes {
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

/// One external program invocation
///
/// Lifecycle: created -> running -> finished (or failed to spawn). It is
/// configured while created, started once, and owns the OS child from then
/// on: all waiting and killing goes through it.
///
/// Stdio defaults to null for all three streams.
#[derive(Debug)]
pub struct Process {
    config: ProcessConfig,
    stdin: Input,
    stdout: Output,
    stderr: Output,
    pipes: Pipes,
    state: State,
    killed: bool,
    controller: &'static dyn ProcessTreeController,
}

impl Process {
    /// Create a process for `program` with `args`
    ///
    /// # Examples
    /// ```no_run
    /// use pathhelper_process::Process;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut process = Process::new("git", ["status", "--short"])?;
    /// process.run().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_config(ProcessConfig::new(program).args(args))
    }

    /// Create a process from a full configuration
    pub fn from_config(config: ProcessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stdin: Input::default(),
            stdout: Output::default(),
            stderr: Output::default(),
            pipes: Pipes::default(),
            state: State::Created,
            killed: false,
            controller: tree::platform(),
        })
    }

    /// Use a different tree controller than the platform one
    pub fn with_tree_controller(mut self, controller: &'static dyn ProcessTreeController) -> Self {
        self.controller = controller;
        self
    }

    /// Get process configuration
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Program name or path
    pub fn program(&self) -> &str {
        &self.config.program
    }

    /// Full command line, program first
    pub fn args(&self) -> Vec<String> {
        self.config.argv()
    }

    /// Working directory override; `None` runs in the caller's current directory
    pub fn working_dir(&self) -> Option<&Path> {
        self.config.working_dir.as_deref()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        match self.state {
            State::Created => ProcessState::Created,
            State::Running { .. } => ProcessState::Running,
            State::Finished { .. } => ProcessState::Finished,
            State::SpawnFailed { .. } => ProcessState::SpawnFailed,
        }
    }

    /// OS process id once started
    pub fn pid(&self) -> Option<u32> {
        match self.state {
            State::Running { pid, .. } | State::Finished { pid, .. } => Some(pid),
            _ => None,
        }
    }

    /// Why the spawn failed, if it did
    pub fn spawn_error(&self) -> Option<&io::Error> {
        match &self.state {
            State::SpawnFailed { error } => Some(error),
            _ => None,
        }
    }

    /// Exit status once waited on
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.state {
            State::Finished { status, .. } => Some(status),
            _ => None,
        }
    }

    /// Exit code once waited on; `None` for a signal death
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status().and_then(|status| status.code())
    }

    /// Set working directory
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        self.ensure_created("set working directory")?;
        self.config.working_dir = Some(dir.into());
        Ok(())
    }

    /// Replace the whole environment with `vars`
    pub fn set_env<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.ensure_created("set environment")?;
        self.config.env = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.config.clear_env = true;
        Ok(())
    }

    /// Add one variable on top of the environment
    pub fn add_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.ensure_created("set environment")?;
        self.config.env.insert(key.into(), value.into());
        Ok(())
    }

    /// Route stdin
    pub fn redirect_stdin(&mut self, input: Input) -> Result<()> {
        self.ensure_created("redirect stdin")?;
        self.stdin = input;
        Ok(())
    }

    /// Route stdout
    pub fn redirect_stdout(&mut self, output: Output) -> Result<()> {
        self.ensure_created("redirect stdout")?;
        self.stdout = output;
        Ok(())
    }

    /// Route stderr
    pub fn redirect_stderr(&mut self, output: Output) -> Result<()> {
        self.ensure_created("redirect stderr")?;
        self.stderr = output;
        Ok(())
    }

    /// Take stdin handle (stdin must be [`Input::Piped`])
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.pipes.stdin.take()
    }

    /// Take stdout handle (stdout must be [`Output::Piped`])
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.pipes.stdout.take()
    }

    /// Take stderr handle (stderr must be [`Output::Piped`])
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.pipes.stderr.take()
    }

    /// Spawn the program without waiting for it
    ///
    /// The child is isolated so [`kill`](Self::kill) reaches its descendants.
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_created("start")?;

        let mut cmd = self.config.to_command();
        self.controller.prepare(&mut cmd);

        let (stdin, feed) = std::mem::take(&mut self.stdin).into_parts();
        let (stdout, stdout_sink) = std::mem::take(&mut self.stdout).into_parts();
        let (stderr, stderr_sink) = std::mem::take(&mut self.stderr).into_parts();
        cmd.stdin(stdin).stdout(stdout).stderr(stderr);

        debug!(
            program = %self.config.program,
            args = ?self.config.args,
            "Spawning process"
        );

        let spawned = cmd.spawn();
        // the child holds its own copies of any handles passed in
        drop(cmd);

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                warn!(program = %self.config.program, error = %source, "Failed to spawn process");
                self.state = State::SpawnFailed {
                    error: io::Error::new(source.kind(), source.to_string()),
                };
                return Err(ProcessError::SpawnFailed {
                    program: self.config.program.clone(),
                    source,
                });
            }
        };
        let pid = child.id().unwrap_or(0);

        let mut forwarders = Vec::new();
        if let Some(feed) = feed {
            if let Some(pipe) = child.stdin.take() {
                forwarders.push(stdio::feed_stdin(pipe, feed));
            }
        }
        if let Some(sink) = stdout_sink {
            if let Some(pipe) = child.stdout.take() {
                forwarders.push(stdio::drain(pipe, sink));
            }
        }
        if let Some(sink) = stderr_sink {
            if let Some(pipe) = child.stderr.take() {
                forwarders.push(stdio::drain(pipe, sink));
            }
        }
        self.pipes = Pipes {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        info!(pid = %pid, program = %self.config.program, "Process spawned");
        self.state = State::Running {
            child,
            pid,
            forwarders,
            forward_error: None,
        };
        Ok(())
    }

    /// Wait for the process to exit
    ///
    /// `Ok(())` for exit code 0, [`ProcessError::Terminated`] otherwise. Once
    /// the process has been reaped, later calls return the same result again
    /// without touching the OS.
    pub async fn wait(&mut self) -> Result<()> {
        let state = self.state();
        let (child, pid, forwarders, forward_error) = match &mut self.state {
            State::Running {
                child,
                pid,
                forwarders,
                forward_error,
            } => (child, *pid, forwarders, forward_error),
            State::Finished {
                termination,
                forward_error,
                ..
            } => return finished_outcome(*termination, forward_error.as_ref()),
            _ => {
                return Err(ProcessError::InvalidState {
                    operation: "wait",
                    state,
                })
            }
        };

        let status = child.wait().await?;

        // output is complete only once the copy tasks are done
        while let Some(task) = forwarders.last_mut() {
            let joined = task.await;
            forwarders.pop();
            if let Err(e) = joined.unwrap_or_else(|join| Err(io::Error::other(join))) {
                warn!(pid = %pid, error = %e, "Stream forwarding failed");
                forward_error.get_or_insert(e);
            }
        }

        let termination = Termination::from_status(status, self.killed);
        let forward_error = forward_error.take().map(|e| (e.kind(), e.to_string()));
        match termination {
            Some(termination) => debug!(pid = %pid, %termination, "Process terminated"),
            None => debug!(pid = %pid, "Process exited cleanly"),
        }

        let outcome = finished_outcome(termination, forward_error.as_ref());
        self.state = State::Finished {
            pid,
            status,
            termination,
            forward_error,
        };
        outcome
    }

    /// Start the process and wait for it
    pub async fn run(&mut self) -> Result<()> {
        self.start()?;
        self.wait().await
    }

    /// Kill the process and every descendant
    ///
    /// If the process already exited, descendants it left behind are still
    /// killed where the platform can find them without it. Does not reap the
    /// process: call [`wait`](Self::wait) afterwards to collect the (killed)
    /// status.
    pub fn kill(&mut self) -> Result<()> {
        self.kill_tree().map(|_| ())
    }

    pub(crate) fn kill_tree(&mut self) -> Result<KillReach> {
        let state = self.state();
        let (pid, exited) = match &mut self.state {
            State::Running { child, pid, .. } => (*pid, matches!(child.try_wait(), Ok(Some(_)))),
            State::Finished { pid, .. } => (*pid, true),
            _ => {
                return Err(ProcessError::InvalidState {
                    operation: "kill",
                    state,
                })
            }
        };

        if exited {
            // once reaped the pid may already belong to someone else
            if self.controller.kill_leftovers(pid)? {
                debug!(pid = %pid, "Process already exited, killed what it left running");
                return Ok(KillReach::Leftovers);
            }
            debug!(pid = %pid, "Process already exited, nothing to kill");
            return Ok(KillReach::Nothing);
        }

        debug!(pid = %pid, "Killing process tree");
        self.controller.kill_tree(pid)?;
        self.killed = true;
        Ok(KillReach::Process)
    }

    fn ensure_created(&self, operation: &'static str) -> Result<()> {
        match self.state {
            State::Created => Ok(()),
            _ => Err(ProcessError::InvalidState {
                operation,
                state: self.state(),
            }),
        }
    }
}

fn finished_outcome(
    termination: Option<Termination>,
    forward_error: Option<&(io::ErrorKind, String)>,
) -> Result<()> {
    if let Some(termination) = termination {
        return Err(ProcessError::Terminated(termination));
    }
    if let Some((kind, message)) = forward_error {
        return Err(ProcessError::Io(io::Error::new(*kind, message.clone())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdio::CaptureBuffer;

    #[test]
    fn test_new_rejects_empty_program() {
        let err = Process::new("", Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, ProcessError::InvalidConfig(_)));
    }

    #[test]
    fn test_accessors_before_start() {
        let process = Process::new("make", ["-j", "4"]).unwrap();
        assert_eq!(process.program(), "make");
        assert_eq!(process.args(), vec!["make", "-j", "4"]);
        assert_eq!(process.working_dir(), None);
        assert_eq!(process.state(), ProcessState::Created);
        assert_eq!(process.pid(), None);
        assert_eq!(process.exit_code(), None);
    }

    #[tokio::test]
    async fn test_wait_before_start_is_invalid() {
        let mut process = Process::new("true", Vec::<String>::new()).unwrap();
        let err = process.wait().await.unwrap_err();
        assert!(matches!(
            err,
            ProcessError::InvalidState {
                operation: "wait",
                state: ProcessState::Created
            }
        ));
    }

    #[test]
    fn test_kill_before_start_is_invalid() {
        let mut process = Process::new("true", Vec::<String>::new()).unwrap();
        assert!(matches!(
            process.kill(),
            Err(ProcessError::InvalidState { operation: "kill", .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let mut process = Process::new("definitely-not-a-real-binary-4242", ["x"]).unwrap();

        let err = process.start().unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
        assert_eq!(process.state(), ProcessState::SpawnFailed);
        assert_eq!(
            process.spawn_error().map(io::Error::kind),
            Some(io::ErrorKind::NotFound)
        );

        let err = process.wait().await.unwrap_err();
        assert!(matches!(
            err,
            ProcessError::InvalidState {
                state: ProcessState::SpawnFailed,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_success() {
        let mut process = Process::new("true", Vec::<String>::new()).unwrap();
        process.run().await.unwrap();
        assert_eq!(process.state(), ProcessState::Finished);
        assert_eq!(process.exit_code(), Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_exit_code() {
        let mut process = Process::new("sh", ["-c", "exit 3"]).unwrap();
        let err = process.run().await.unwrap_err();
        assert!(matches!(err, ProcessError::Terminated(Termination::ExitCode(3))));
        assert_eq!(err.to_string(), "exit status 3");
        assert_eq!(process.exit_code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_is_idempotent() {
        let mut process = Process::new("sh", ["-c", "exit 7"]).unwrap();
        process.start().unwrap();

        let first = process.wait().await.unwrap_err();
        let second = process.wait().await.unwrap_err();
        assert_eq!(first.termination(), Some(Termination::ExitCode(7)));
        assert_eq!(first.termination(), second.termination());
        assert_eq!(process.exit_code(), Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_configuration_locked_after_start() {
        let mut process = Process::new("true", Vec::<String>::new()).unwrap();
        process.start().unwrap();

        assert!(process.set_working_dir("/").is_err());
        assert!(process.add_env("A", "B").is_err());
        assert!(process.redirect_stdout(Output::Inherit).is_err());
        assert!(matches!(
            process.start(),
            Err(ProcessError::InvalidState {
                operation: "start",
                state: ProcessState::Running
            })
        ));

        process.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_reports_killed() {
        let mut process = Process::new("sleep", ["30"]).unwrap();
        process.start().unwrap();
        process.kill().unwrap();

        let err = process.wait().await.unwrap_err();
        assert!(matches!(err, ProcessError::Terminated(Termination::Killed)));
        assert_eq!(err.to_string(), "signal: killed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_after_exit_is_noop() {
        let mut process = Process::new("true", Vec::<String>::new()).unwrap();
        process.run().await.unwrap();

        process.kill().unwrap();
        assert_eq!(process.kill_tree().unwrap(), KillReach::Nothing);
        process.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[derive(Debug)]
    struct FailingController;

    #[cfg(unix)]
    impl ProcessTreeController for FailingController {
        fn prepare(&self, _command: &mut tokio::process::Command) {}

        fn kill_tree(&self, pid: u32) -> Result<()> {
            Err(ProcessError::KillFailed {
                pid,
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            })
        }
    }

    #[cfg(unix)]
    static FAILING: FailingController = FailingController;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_kill_does_not_mark_killed() {
        let mut process = Process::new("sleep", ["0.2"])
            .unwrap()
            .with_tree_controller(&FAILING);
        process.start().unwrap();

        assert!(matches!(process.kill(), Err(ProcessError::KillFailed { .. })));
        assert!(!process.killed);

        process.wait().await.unwrap();
    }

    /// Dead or a zombie nobody reaped yet
    #[cfg(target_os = "linux")]
    fn is_dead(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_kill_after_exit_reaches_leftovers() {
        use tokio::io::AsyncReadExt;

        let mut process = Process::new("sh", ["-c", "sleep 30 >/dev/null & echo $!"]).unwrap();
        process.redirect_stdout(Output::Piped).unwrap();
        process.start().unwrap();

        let mut line = String::new();
        process
            .take_stdout()
            .unwrap()
            .read_to_string(&mut line)
            .await
            .unwrap();
        let orphan: u32 = line.trim().parse().unwrap();

        process.wait().await.unwrap();
        assert!(!is_dead(orphan));

        assert_eq!(process.kill_tree().unwrap(), KillReach::Leftovers);
        let mut gone = false;
        for _ in 0..50 {
            if is_dead(orphan) {
                gone = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(gone, "orphan {orphan} survived the kill");

        // the process itself keeps its own clean outcome
        process.wait().await.unwrap();
        assert!(!process.killed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_bytes_and_capture() {
        let stdout = CaptureBuffer::new();
        let mut process = Process::new("cat", Vec::<String>::new()).unwrap();
        process.redirect_stdin(Input::Bytes(b"fed through stdin".to_vec())).unwrap();
        process.redirect_stdout(Output::Capture(stdout.clone())).unwrap();

        process.run().await.unwrap();
        assert_eq!(stdout.contents(), b"fed through stdin");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_piped_stdout_is_handed_out() {
        use tokio::io::AsyncReadExt;

        let mut process = Process::new("echo", ["piped"]).unwrap();
        process.redirect_stdout(Output::Piped).unwrap();
        process.start().unwrap();

        let mut out = String::new();
        let mut stdout = process.take_stdout().unwrap();
        stdout.read_to_string(&mut out).await.unwrap();
        assert!(process.take_stdout().is_none());

        process.wait().await.unwrap();
        assert_eq!(out, "piped\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_working_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = CaptureBuffer::new();

        let mut process = Process::new("sh", ["-c", "pwd -P; echo \"$GREETING\""]).unwrap();
        process.set_working_dir(dir.path()).unwrap();
        process.add_env("GREETING", "hello").unwrap();
        process.redirect_stdout(Output::Capture(stdout.clone())).unwrap();
        process.run().await.unwrap();

        let expected = format!("{}\nhello\n", dir.path().canonicalize().unwrap().display());
        assert_eq!(String::from_utf8(stdout.contents()).unwrap(), expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_set_env_replaces_environment() {
        std::env::set_var("PATHHELPER_PARENT_ONLY", "leaked");
        let stdout = CaptureBuffer::new();

        let mut process =
            Process::new("/bin/sh", ["-c", "echo \"$ONLY:$PATHHELPER_PARENT_ONLY\""]).unwrap();
        process.set_env([("ONLY", "kept")]).unwrap();
        process.redirect_stdout(Output::Capture(stdout.clone())).unwrap();
        process.run().await.unwrap();

        assert_eq!(stdout.contents(), b"kept:\n");
    }
}
