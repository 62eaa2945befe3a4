//! Snapshot based tree control for Windows
//!
//! Windows has no process groups usable for this, so the tree is recovered at
//! kill time from a Toolhelp snapshot of every visible process and its parent.

use std::io;
use std::mem::size_of;

use tokio::process::Command;
use tracing::{debug, warn};
use windows::Win32::Foundation::{CloseHandle, ERROR_INVALID_PARAMETER, FILETIME};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Threading::{
    GetProcessTimes, OpenProcess, TerminateProcess, CREATE_NO_WINDOW,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE,
};

use super::{ProcessSnapshot, ProcessTreeController, KILL_EXIT_CODE};
use crate::error::{ProcessError, Result};

/// Kills a process tree found through a fresh process snapshot
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolhelpSnapshots;

impl ProcessTreeController for ToolhelpSnapshots {
    fn prepare(&self, command: &mut Command) {
        // no group to create; just keep console programs from opening a window
        command.creation_flags(CREATE_NO_WINDOW.0);
    }

    fn kill_tree(&self, pid: u32) -> Result<()> {
        let snapshot = capture().map_err(|source| ProcessError::KillFailed { pid, source })?;
        // orphans still name their dead parent's pid; drop those older than the target
        let times: Vec<(u32, u64)> = snapshot
            .kill_order(pid)
            .into_iter()
            .filter_map(|candidate| start_time(candidate).map(|time| (candidate, time)))
            .collect();
        let order = snapshot.with_start_times(times).kill_order(pid);
        debug!(pid = %pid, processes = order.len(), "Terminating process tree");

        for target in order {
            terminate(target).map_err(|source| {
                warn!(pid = %pid, target = %target, error = %source, "Failed to terminate process");
                ProcessError::KillFailed {
                    pid: target,
                    source,
                }
            })?;
        }
        Ok(())
    }
}

/// Take a snapshot of every running process and its parent
fn capture() -> io::Result<ProcessSnapshot> {
    // SAFETY: the snapshot handle is closed before returning and the entry
    // buffer carries the size the API expects.
    unsafe {
        let handle = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0).map_err(io::Error::other)?;

        let mut entry = PROCESSENTRY32W {
            dwSize: size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };
        let mut parents = Vec::new();
        let mut more = Process32FirstW(handle, &mut entry).is_ok();
        while more {
            parents.push((entry.th32ProcessID, entry.th32ParentProcessID));
            more = Process32NextW(handle, &mut entry).is_ok();
        }

        let _ = CloseHandle(handle);
        Ok(ProcessSnapshot::from_parents(parents))
    }
}

/// Creation time of `pid` in 100ns ticks, `None` if it cannot be queried
fn start_time(pid: u32) -> Option<u64> {
    // SAFETY: the process handle is closed on every path after it is opened
    // and the time buffers outlive the call.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid).ok()?;
        let mut created = FILETIME::default();
        let mut exited = FILETIME::default();
        let mut kernel = FILETIME::default();
        let mut user = FILETIME::default();
        let queried = GetProcessTimes(handle, &mut created, &mut exited, &mut kernel, &mut user);
        let _ = CloseHandle(handle);
        queried.ok()?;
        Some((u64::from(created.dwHighDateTime) << 32) | u64::from(created.dwLowDateTime))
    }
}

/// Terminate one pid; a pid that has already exited is skipped
fn terminate(pid: u32) -> io::Result<()> {
    // SAFETY: the process handle is closed on every path after it is opened.
    unsafe {
        let handle = match OpenProcess(PROCESS_TERMINATE, false, pid) {
            Ok(handle) => handle,
            Err(e) if e.code() == ERROR_INVALID_PARAMETER.to_hresult() => return Ok(()),
            Err(e) => return Err(io::Error::other(e)),
        };

        let terminated = TerminateProcess(handle, KILL_EXIT_CODE);
        let _ = CloseHandle(handle);
        terminated.map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sees_current_process() {
        let snapshot = capture().unwrap();
        let me = std::process::id();
        let parent = snapshot.parent(me).unwrap();
        assert!(snapshot.children(parent).contains(&me));
    }

    #[tokio::test]
    async fn test_kill_tree_terminates_with_fixed_code() {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "ping -n 30 127.0.0.1 > NUL"]);
        ToolhelpSnapshots.prepare(&mut cmd);

        let mut child = cmd.spawn().unwrap();
        ToolhelpSnapshots.kill_tree(child.id().unwrap()).unwrap();

        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(KILL_EXIT_CODE as i32));
    }

    #[test]
    fn test_child_starts_after_parent() {
        let me = std::process::id();
        let parent = capture().unwrap().parent(me).unwrap();
        let mine = start_time(me).unwrap();
        if let Some(theirs) = start_time(parent) {
            assert!(theirs <= mine);
        }
        assert_eq!(start_time(3), None);
    }

    #[test]
    fn test_kill_missing_pid_is_not_an_error() {
        // pids are multiples of 4; this one is never handed out
        assert!(terminate(3).is_ok());
    }
}
