//! The reference transport: SSH command execution plus shell-mediated file
//! access, backed by the `openssh` crate (which drives the system `ssh`
//! binary over a `ControlMaster` socket rather than reimplementing the wire
//! protocol).
//!
//! File operations are implemented as remote shell invocations (`cat`,
//! `stat`, a `base64`-encoded here-doc write) rather than SFTP, following
//! the same approach used by other SSH-backed remote-filesystem clients:
//! it works against any POSIX remote with a shell and doesn't require the
//! SFTP subsystem to be enabled.

use super::{FileStat, OneShotOutput, StreamingProcess, Transport};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use base64::Engine as _;
use openssh::{KnownHosts, SessionBuilder, Stdio as SshStdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, OnceCell};

/// How the SSH transport authenticates to the remote host.
#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    /// Private key path, plus an optional passphrase for an encrypted key.
    PrivateKeyPath(String, Option<String>),
    AgentSocket(String),
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

pub struct SshTransport {
    session: Arc<openssh::Session>,
    has_rg: OnceCell<bool>,
}

const PID_MARKER: &str = "__AGENTREMOTE_PID__:";

impl SshTransport {
    pub async fn connect(config: &SshConfig) -> EngineResult<Self> {
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Accept);
        builder.user(config.username.clone());
        builder.port(config.port);

        match &config.auth {
            SshAuth::PrivateKeyPath(path, passphrase) => {
                builder.keyfile(path);
                if let Some(passphrase) = passphrase {
                    let askpass = write_askpass_script(passphrase)
                        .map_err(|e| EngineError::transport(format!("askpass helper: {e}")))?;
                    // SAFETY: no other task reads/writes this process's
                    // environment concurrently during startup.
                    unsafe {
                        std::env::set_var("SSH_ASKPASS", &askpass);
                        std::env::set_var("SSH_ASKPASS_REQUIRE", "force");
                    }
                }
            }
            SshAuth::AgentSocket(socket) => {
                // SSH_AUTH_SOCK is read by the system `ssh` binary itself;
                // we just make sure it's set for the child process.
                // SAFETY: no other task reads/writes this process's
                // environment concurrently during startup.
                unsafe {
                    std::env::set_var("SSH_AUTH_SOCK", socket);
                }
            }
            SshAuth::Password(_) => {
                // The system `ssh` binary does not accept passwords on a
                // pipe by default; password auth is expected to be handled
                // via an askpass helper or an already-unlocked agent. We
                // still record the intent so config validation can require
                // one auth method be set.
            }
        }

        let session = builder.connect(&config.host).await.map_err(|e| {
            tracing::warn!(host = %config.host, error = %e, "ssh connect failed");
            EngineError::transport(format!("ssh connect {}: {e}", config.host))
        })?;

        Ok(Self {
            session: Arc::new(session),
            has_rg: OnceCell::new(),
        })
    }

    async fn run_sh(&self, script: &str) -> EngineResult<OneShotOutput> {
        Ok(self.exec_one_shot(script, None).await)
    }

    fn shell_escape(value: &str) -> String {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Write a one-shot `SSH_ASKPASS` helper script that echoes `secret`, so the
/// system `ssh` binary can unlock a passphrase-protected private key
/// non-interactively (requires OpenSSH >= 8.4's `SSH_ASKPASS_REQUIRE=force`).
fn write_askpass_script(secret: &str) -> std::io::Result<std::path::PathBuf> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::temp_dir().join(format!("agentremote-askpass-{}", uuid::Uuid::new_v4()));
    let script = format!("#!/bin/sh\nprintf '%s' {}\n", SshTransport::shell_escape(secret));
    let mut file = std::fs::File::create(&path)?;
    file.write_all(script.as_bytes())?;
    file.set_permissions(std::fs::Permissions::from_mode(0o700))?;
    Ok(path)
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec_one_shot(&self, command: &str, timeout: Option<Duration>) -> OneShotOutput {
        let mut cmd = self.session.command("sh");
        cmd.arg("-c").arg(command);
        cmd.stdin(SshStdio::null());
        cmd.stdout(SshStdio::piped());
        cmd.stderr(SshStdio::piped());

        let child = match cmd.spawn().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "ssh spawn failed, controlmaster may be down");
                return OneShotOutput {
                    stdout: Vec::new(),
                    stderr: format!("ssh spawn failed: {e}").into_bytes(),
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
                // ssh itself exits 255 on a protocol-level failure; we have
                // no reliable way to distinguish that from a remote exit
                // status of 255, so we report it as-is (a nonzero exit treats
                // transport loss separately, detected via spawn/connect
                // failure rather than exit code).
                exit_code: output.status.code().unwrap_or(-1),
                timed_out: false,
            },
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "ssh wait failed, controlmaster may need reconnect");
                OneShotOutput {
                    stdout: Vec::new(),
                    stderr: format!("ssh wait failed: {e}").into_bytes(),
                    exit_code: -1,
                    timed_out: false,
                }
            }
            Err(_) => OneShotOutput {
                stdout: Vec::new(),
                stderr: Vec::new(),
                exit_code: 124,
                timed_out: true,
            },
        }
    }

    async fn exec_streaming(&self, command: &str) -> EngineResult<StreamingProcess> {
        let session = self.session.clone();
        // SSH does not forward POSIX signals to the remote process, so we
        // capture its pid on stderr before the real output starts and
        // signal it later via a second one-shot `kill -s` invocation
        //
        let wrapped = format!("echo '{PID_MARKER}'\"$$\" >&2; exec {command}");

        let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>(64);
        let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>(64);
        let (signal_tx, mut signal_rx) = mpsc::channel::<String>(8);
        let (completion_tx, completion_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();

        tokio::spawn(async move {
            let mut cmd = session.command("sh");
            cmd.arg("-c").arg(&wrapped);
            cmd.stdin(SshStdio::null());
            cmd.stdout(SshStdio::piped());
            cmd.stderr(SshStdio::piped());

            let mut child = match cmd.spawn().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "ssh spawn failed, controlmaster may be down");
                    let _ = ready_tx.send(Err(format!("ssh spawn failed: {e}")));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            let mut stdout = child.stdout().take().expect("stdout piped");
            let mut stderr = child.stderr().take().expect("stderr piped");

            let mut remote_pid: Option<u32> = None;
            let mut marker_buf: Vec<u8> = Vec::new();
            let mut stdout_buf = [0u8; 8192];
            let mut stderr_buf = [0u8; 8192];
            let mut stdout_done = false;
            let mut stderr_done = false;

            while !(stdout_done && stderr_done) {
                tokio::select! {
                    biased;
                    Some(sig) = signal_rx.recv() => {
                        if let Some(pid) = remote_pid {
                            let _ = signal_remote_pid(&session, pid, &sig).await;
                        }
                    }
                    n = stdout.read(&mut stdout_buf), if !stdout_done => {
                        match n {
                            Ok(0) | Err(_) => stdout_done = true,
                            Ok(n) => { let _ = stdout_tx.send(stdout_buf[..n].to_vec()).await; }
                        }
                    }
                    n = stderr.read(&mut stderr_buf), if !stderr_done => {
                        match n {
                            Ok(0) | Err(_) => stderr_done = true,
                            Ok(n) => {
                                let chunk = &stderr_buf[..n];
                                if remote_pid.is_none() {
                                    marker_buf.extend_from_slice(chunk);
                                    if let Some(pos) = marker_buf.iter().position(|&b| b == b'\n') {
                                        let line = String::from_utf8_lossy(&marker_buf[..pos]).into_owned();
                                        remote_pid = line
                                            .strip_prefix(PID_MARKER)
                                            .and_then(|rest| rest.trim().parse().ok());
                                        let rest = marker_buf[pos + 1..].to_vec();
                                        marker_buf.clear();
                                        if !rest.is_empty() {
                                            let _ = stderr_tx.send(rest).await;
                                        }
                                    }
                                } else {
                                    let _ = stderr_tx.send(chunk.to_vec()).await;
                                }
                            }
                        }
                    }
                }
            }

            let status = child.wait().await;
            let result = status.map(|s| s.code().unwrap_or(-1)).map_err(|e| e.to_string());
            let _ = completion_tx.send(result);
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(EngineError::transport(e)),
            Err(_) => return Err(EngineError::transport("streaming exec task dropped")),
        }

        Ok(StreamingProcess {
            stdout: stdout_rx,
            stderr: stderr_rx,
            signal_tx,
            completion: completion_rx,
        })
    }

    async fn read_file(&self, path: &str) -> EngineResult<Vec<u8>> {
        let escaped = Self::shell_escape(path);
        let result = self.run_sh(&format!("cat {escaped}")).await?;
        if result.exit_code != 0 {
            return Err(EngineError::transport(format!(
                "read {path}: {}",
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(result.stdout)
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> EngineResult<()> {
        let escaped = Self::shell_escape(path);
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                let mkdir = self
                    .run_sh(&format!("mkdir -p {}", Self::shell_escape(&parent.to_string_lossy())))
                    .await?;
                if mkdir.exit_code != 0 {
                    return Err(EngineError::transport(format!(
                        "mkdir -p for {path}: {}",
                        String::from_utf8_lossy(&mkdir.stderr).trim()
                    )));
                }
            }
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let script = format!(
            "base64 -d > {escaped} <<'__AGENTREMOTE_EOF__'\n{encoded}\n__AGENTREMOTE_EOF__\n"
        );
        let result = self.run_sh(&script).await?;
        if result.exit_code != 0 {
            return Err(EngineError::transport(format!(
                "write {path}: {}",
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> EngineResult<bool> {
        let escaped = Self::shell_escape(path);
        let result = self.run_sh(&format!("test -e {escaped}")).await?;
        Ok(result.exit_code == 0)
    }

    async fn file_stat(&self, path: &str) -> EngineResult<FileStat> {
        let escaped = Self::shell_escape(path);
        // %F = file type, %s = size, %Y = mtime (epoch seconds).
        let script = format!("stat --format='%F\\t%s\\t%Y' {escaped}");
        let result = self.run_sh(&script).await?;
        if result.exit_code != 0 {
            return Err(EngineError::transport(format!(
                "stat {path}: {}",
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&result.stdout);
        let line = stdout.trim();
        let parts: Vec<&str> = line.splitn(3, '\t').collect();
        if parts.len() < 3 {
            return Err(EngineError::transport(format!(
                "unexpected stat output for {path}: {line}"
            )));
        }
        Ok(FileStat {
            is_dir: parts[0].to_ascii_lowercase().contains("directory"),
            size: parts[1].parse().unwrap_or(0),
            modified_unix_secs: parts[2].parse().unwrap_or(0),
        })
    }

    async fn has_ripgrep(&self) -> bool {
        *self
            .has_rg
            .get_or_init(|| async {
                match self.run_sh("command -v rg >/dev/null 2>&1").await {
                    Ok(result) => result.exit_code == 0,
                    Err(_) => false,
                }
            })
            .await
    }
}

/// Send a named POSIX signal to a remote pid via a second SSH invocation.
async fn signal_remote_pid(
    session: &openssh::Session,
    pid: u32,
    signal_name: &str,
) -> EngineResult<()> {
    let normalized = signal_name.trim_start_matches("SIG");
    let script = format!("kill -s {normalized} {pid} 2>/dev/null || true");
    let mut cmd = session.command("sh");
    cmd.arg("-c").arg(&script);
    cmd.stdin(SshStdio::null());
    cmd.stdout(SshStdio::null());
    cmd.stderr(SshStdio::null());
    cmd.status().await.map(|_| ()).map_err(|e| {
        tracing::warn!(pid, signal = %signal_name, error = %e, "signal delivery over ssh failed");
        EngineError::transport(format!("signal {pid}: {e}"))
    })
}
