//! Transport abstraction.
//!
//! The engine depends only on this narrow capability surface: one-shot
//! command execution, streaming command execution with a signal channel and
//! a completion future, and absolute-path file read/write/stat. Everything
//! above this module (bash executor, file primitives, search) is written
//! against [`Transport`] and never inspects which concrete transport is in
//! use.

pub mod local;
pub mod ssh;

use crate::error::EngineResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Result of a one-shot command execution (`execOneShot`).
#[derive(Debug, Clone)]
pub struct OneShotOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// A long-lived command session (`execStreaming`).
///
/// `stdout`/`stderr` yield chunks as they arrive. Sending a signal name on
/// `signal_tx` asks the transport to deliver that POSIX signal to the remote
/// process. `completion` resolves exactly once, with the exit code or a
/// transport-level failure message.
pub struct StreamingProcess {
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub stderr: mpsc::Receiver<Vec<u8>>,
    pub signal_tx: mpsc::Sender<String>,
    pub completion: oneshot::Receiver<Result<i32, String>>,
}

/// Metadata about a remote path, as much as `stat` can tell us.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
    pub modified_unix_secs: i64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command` to completion via the remote shell, aggregating output
    /// in memory. `timeout` of `None` means no timeout.
    async fn exec_one_shot(&self, command: &str, timeout: Option<Duration>) -> OneShotOutput;

    /// Start `command` and return a handle to its live streams. Does not
    /// apply a timeout itself -- callers that want one race `completion`
    /// against their own clock and send a signal on expiry.
    async fn exec_streaming(&self, command: &str) -> EngineResult<StreamingProcess>;

    /// Read an absolute file path in full.
    async fn read_file(&self, path: &str) -> EngineResult<Vec<u8>>;

    /// Overwrite an absolute file path, creating missing parent directories.
    async fn write_file(&self, path: &str, content: &[u8]) -> EngineResult<()>;

    /// Whether a path exists (file, directory, or symlink).
    async fn file_exists(&self, path: &str) -> EngineResult<bool>;

    /// `stat` an absolute path.
    async fn file_stat(&self, path: &str) -> EngineResult<FileStat>;

    /// Whether `rg` is available on the remote. Implementations should
    /// memoize this per instance.
    async fn has_ripgrep(&self) -> bool;
}
