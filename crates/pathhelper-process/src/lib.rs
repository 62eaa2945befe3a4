//! # pathhelper-process
//!
//! **Purpose**: Process execution and lifecycle control for build tooling
//!
//! Spawns external programs, chains them like a shell pipeline, bounds their
//! runtime with a deadline or cancellation token, and kills the whole process
//! tree a child leaves behind.
//!
//! ## Features
//!
//! - **Process lifecycle**: configure, start, wait (idempotent), kill
//! - **Stdio routing**: null, inherit, piped, in-memory capture, any async reader/writer
//! - **Cancellation**: race the exit against a deadline, a token, or any future
//! - **Process tree kill**: process groups + `SIGKILL` on Unix, snapshot walk +
//!   `TerminateProcess` on Windows
//! - **Pipelines**: `a | b | c` with the last stage's output collected
//!
//! Captured output is held in memory without a size cap.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use pathhelper_process::{pipe_commands, Process};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Bound a build by a deadline; the compiler and everything it spawned
//! // are killed when it runs over
//! let mut build = Process::new("make", ["-j", "8"])?;
//! build.set_working_dir("firmware")?;
//! build.run_with_timeout(Duration::from_secs(300)).await?;
//!
//! // Equivalent of `git tag --list | sort -V`
//! let tags = pipe_commands(vec![
//!     Process::new("git", ["tag", "--list"])?,
//!     Process::new("sort", ["-V"])?,
//! ])
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod pipe;
pub mod process;
pub mod stdio;
pub mod supervisor;
pub mod tree;

pub use config::ProcessConfig;
pub use error::{ProcessError, ProcessState, Result, Termination};
pub use pipe::{pipe_commands, PipeChain, PipeOutput};
pub use process::Process;
pub use stdio::{CaptureBuffer, Input, Output};
pub use supervisor::CapturedOutput;
pub use tokio_util::sync::CancellationToken;
pub use tree::{ProcessSnapshot, ProcessTreeController};
