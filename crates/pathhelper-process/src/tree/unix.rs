//! Process-group based tree control for Unix

use std::io;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, getpgrp, Pid};
use tokio::process::Command;
use tracing::{debug, warn};

use super::ProcessTreeController;
use crate::error::{ProcessError, Result};

/// Puts every child in its own process group and kills the group with `SIGKILL`
///
/// Descendants that create a new group or session of their own escape the kill.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroups;

impl ProcessTreeController for ProcessGroups {
    fn prepare(&self, command: &mut Command) {
        // pgid == pid
        command.process_group(0);
    }

    fn kill_tree(&self, pid: u32) -> Result<()> {
        let target = target_pid(pid)?;

        let pgid = match getpgid(Some(target)) {
            Ok(pgid) => pgid,
            Err(Errno::ESRCH) => {
                debug!(pid = %pid, "Process already gone, nothing to kill");
                return Ok(());
            }
            Err(errno) => return Err(kill_failed(pid, errno)),
        };

        if pgid == getpgrp() {
            // never signal our own group
            warn!(pid = %pid, "Process shares the caller's group, killing it alone");
            return deliver(pid, kill(target, Signal::SIGKILL));
        }

        debug!(pid = %pid, pgid = %pgid, "Sending SIGKILL to process group");
        deliver(pid, killpg(pgid, Signal::SIGKILL))
    }

    fn kill_leftovers(&self, pid: u32) -> Result<bool> {
        // `prepare` made the leader's pid the group id, and a group id is not
        // handed out again while the group still has members
        let pgid = target_pid(pid)?;
        if pgid == getpgrp() {
            return Ok(false);
        }

        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => {
                debug!(pgid = %pgid, "Killed processes left in the group of an exited leader");
                Ok(true)
            }
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(kill_failed(pid, errno)),
        }
    }
}

fn target_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
        .ok_or_else(|| ProcessError::KillFailed {
            pid,
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a valid process id"),
        })
}

fn deliver(pid: u32, sent: nix::Result<()>) -> Result<()> {
    match sent {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(kill_failed(pid, errno)),
    }
}

fn kill_failed(pid: u32, errno: Errno) -> ProcessError {
    warn!(pid = %pid, error = %errno, "Failed to kill process tree");
    ProcessError::KillFailed {
        pid,
        source: io::Error::from(errno),
    }
}
