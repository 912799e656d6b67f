//! Local transport: runs commands via `tokio::process` and touches the local
//! filesystem directly.
//!
//! This is the collaborator transport used by the test suite and by
//! operators who run the controller on the same host they want to operate
//! on (the "in-container exec" case). It implements the
//! same [`Transport`] trait as [`super::ssh::SshTransport`]; the rest of the
//! engine cannot tell them apart.

use super::{FileStat, OneShotOutput, StreamingProcess, Transport};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Command, CommandExt};
use tokio::sync::{mpsc, oneshot, OnceCell};

pub struct LocalTransport {
    has_rg: OnceCell<bool>,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            has_rg: OnceCell::new(),
        }
    }

    fn build_command(command: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Run in its own process group so background commands can be killed
        // (and all their children) by signaling the negated pid.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }
        cmd
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain a pipe into chunks, forwarding each chunk over `tx` as it arrives.
async fn pump<R: tokio::io::AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn exec_one_shot(&self, command: &str, timeout: Option<Duration>) -> OneShotOutput {
        let mut cmd = Self::build_command(command);
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return OneShotOutput {
                    stdout: Vec::new(),
                    stderr: format!("failed to spawn process: {e}").into_bytes(),
                    exit_code: -1,
                    timed_out: false,
                };
            }
        };

        let fut = child.wait_with_output();
        let result = match timeout {
            Some(dur) => tokio::time::timeout(dur, fut).await,
            None => Ok(fut.await),
        };

        match result {
            Ok(Ok(output)) => OneShotOutput {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.status.code().unwrap_or(-1),
                timed_out: false,
            },
            Ok(Err(e)) => OneShotOutput {
                stdout: Vec::new(),
                stderr: format!("process wait failed: {e}").into_bytes(),
                exit_code: -1,
                timed_out: false,
            },
            Err(_) => OneShotOutput {
                stdout: Vec::new(),
                stderr: Vec::new(),
                exit_code: 124,
                timed_out: true,
            },
        }
    }

    async fn exec_streaming(&self, command: &str) -> EngineResult<StreamingProcess> {
        let mut cmd = Self::build_command(command);
        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::transport(format!("failed to spawn process: {e}")))?;

        let pid = child.id();
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let (stdout_tx, stdout_rx) = mpsc::channel(64);
        let (stderr_tx, stderr_rx) = mpsc::channel(64);
        tokio::spawn(pump(stdout, stdout_tx));
        tokio::spawn(pump(stderr, stderr_tx));

        let (signal_tx, mut signal_rx) = mpsc::channel::<String>(8);
        let (completion_tx, completion_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    sig = signal_rx.recv() => {
                        let Some(sig) = sig else { continue };
                        if let Some(pid) = pid {
                            let _ = send_signal(pid, &sig);
                        }
                    }
                    status = child.wait() => {
                        let result = status
                            .map(|s| s.code().unwrap_or(-1))
                            .map_err(|e| e.to_string());
                        let _ = completion_tx.send(result);
                        break;
                    }
                }
            }
        });

        Ok(StreamingProcess {
            stdout: stdout_rx,
            stderr: stderr_rx,
            signal_tx,
            completion: completion_rx,
        })
    }

    async fn read_file(&self, path: &str) -> EngineResult<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::transport(format!("read {path}: {e}")))
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> EngineResult<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| EngineError::transport(format!("mkdir -p {path}: {e}")))?;
            }
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| EngineError::transport(format!("write {path}: {e}")))
    }

    async fn file_exists(&self, path: &str) -> EngineResult<bool> {
        Ok(tokio::fs::metadata(path).await.is_ok())
    }

    async fn file_stat(&self, path: &str) -> EngineResult<FileStat> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| EngineError::transport(format!("stat {path}: {e}")))?;
        Ok(FileStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
            modified_unix_secs: meta.mtime(),
        })
    }

    async fn has_ripgrep(&self) -> bool {
        *self
            .has_rg
            .get_or_init(|| async {
                Command::new("which")
                    .arg("rg")
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .map(|s| s.success())
                    .unwrap_or(false)
            })
            .await
    }
}

/// Send a POSIX signal (by name, e.g. `"SIGTERM"`) to a process group.
fn send_signal(pid: u32, signal_name: &str) -> EngineResult<()> {
    let signal: nix::sys::signal::Signal = signal_name
        .parse()
        .map_err(|_| EngineError::validation(format!("unknown signal: {signal_name}")))?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(-(pid as i32)), signal)
        .map_err(|e| EngineError::transport(format!("kill failed: {e}")))
}
