//! Process tree control
//!
//! A spawned program may start children of its own. To stop the whole tree
//! the child has to be set up at spawn time so it can later be addressed as
//! a unit:
//!
//! - Unix: the child leads a new process group and the kill signals the group.
//! - Windows: there are no groups; the kill walks a fresh process snapshot.
//!
//! Callers only see [`ProcessTreeController`]; the implementation is picked
//! at compile time by [`platform`].

use std::fmt;

use tokio::process::Command;

use crate::error::Result;

mod snapshot;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub use snapshot::ProcessSnapshot;
#[cfg(unix)]
pub use unix::ProcessGroups;
#[cfg(windows)]
pub use self::windows::ToolhelpSnapshots;

/// Exit code given to every process terminated by a Windows tree kill
pub const KILL_EXIT_CODE: u32 = 128;

/// Spawn-time isolation and kill-time termination of a process tree
pub trait ProcessTreeController: Send + Sync + fmt::Debug {
    /// Adjust `command` so the spawned process can later be killed with its descendants
    fn prepare(&self, command: &mut Command);

    /// Forcefully terminate `pid` and every live descendant.
    ///
    /// A target that no longer exists counts as already terminated.
    fn kill_tree(&self, pid: u32) -> Result<()>;

    /// Kill whatever is left of the tree after `pid` itself exited and was reaped.
    ///
    /// Returns whether anything was left to kill. Controllers that can only
    /// find a tree through its live root report nothing.
    fn kill_leftovers(&self, pid: u32) -> Result<bool> {
        let _ = pid;
        Ok(false)
    }
}

#[cfg(unix)]
static PLATFORM: ProcessGroups = ProcessGroups;

#[cfg(windows)]
static PLATFORM: ToolhelpSnapshots = ToolhelpSnapshots;

/// Controller for the target OS
pub fn platform() -> &'static dyn ProcessTreeController {
    &PLATFORM
}
