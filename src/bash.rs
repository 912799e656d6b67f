//! `bash`, `bash_output`, and `kill_bash` tool logic.

use crate::error::EngineResult;
use crate::output::cap_tail;
use crate::registry::{SessionRegistry, SessionStatus};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;

/// Default foreground/background timeout when the agent doesn't specify one.
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
/// No caller-supplied timeout may exceed this.
pub const MAX_TIMEOUT_MS: u64 = 600_000;
/// Per-stream cap applied to foreground output.
const OUTPUT_CAP_BYTES: usize = 30_000;

fn clamp_timeout(timeout_ms: Option<u64>) -> Duration {
    let ms = timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS).min(MAX_TIMEOUT_MS);
    Duration::from_millis(ms)
}

/// Render a foreground result the way the agent sees it: labelled stream
/// headers, an elision marker per stream when capped, and a trailing
/// exit-code or timeout line.
fn render_foreground(stdout: &[u8], stderr: &[u8], exit_code: i32, timed_out: bool) -> String {
    let (stdout, stdout_truncated) = cap_tail(stdout, OUTPUT_CAP_BYTES);
    let (stderr, stderr_truncated) = cap_tail(stderr, OUTPUT_CAP_BYTES);

    let mut out = String::new();
    if !stdout.is_empty() {
        out.push_str("[stdout]\n");
        out.push_str(&String::from_utf8_lossy(&stdout));
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    if !stderr.is_empty() {
        out.push_str("[stderr]\n");
        out.push_str(&String::from_utf8_lossy(&stderr));
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    let _ = (stdout_truncated, stderr_truncated); // markers are already inlined by cap_tail

    if timed_out {
        out.push_str(&format!("[timed out after exceeding limit, exit code {exit_code}]\n"));
    } else {
        out.push_str(&format!("[exit code {exit_code}]\n"));
    }
    out
}

/// Run `command` to completion and render the combined result text.
pub async fn run_foreground(
    transport: &dyn Transport,
    command: &str,
    timeout_ms: Option<u64>,
) -> String {
    let timeout = clamp_timeout(timeout_ms);
    let result = transport.exec_one_shot(command, Some(timeout)).await;
    let exit_code = if result.timed_out { 124 } else { result.exit_code };
    render_foreground(&result.stdout, &result.stderr, exit_code, result.timed_out)
}

/// Start `command` in the background, registering a new session.
///
/// Returns the new shell id. `timeout_ms`, if given, is clamped the same as
/// the foreground path and causes the session to be sent `SIGTERM` (and its
/// status set to `Killed`) if the command is still running when it elapses.
pub async fn run_background(
    registry: &SessionRegistry,
    transport: Arc<dyn Transport>,
    command: &str,
    timeout_ms: Option<u64>,
) -> EngineResult<String> {
    let id = format!("shell_{}", uuid::Uuid::new_v4());
    let timeout = timeout_ms.map(clamp_timeout);
    registry
        .spawn_background(id.clone(), command.to_string(), transport, timeout)
        .await?;
    Ok(id)
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BashOutputResult {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
}

/// Fetch everything written to `shell_id`'s streams since the last fetch.
pub async fn bash_output(registry: &SessionRegistry, shell_id: &str) -> EngineResult<BashOutputResult> {
    let session = registry.get(shell_id).await?;
    let snapshot = session.fetch_output().await;
    Ok(BashOutputResult {
        stdout: String::from_utf8_lossy(&snapshot.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&snapshot.stderr).into_owned(),
        truncated: snapshot.truncated,
        status: snapshot.status,
        exit_code: snapshot.exit_code,
    })
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct KillBashResult {
    pub killed: bool,
    pub reason: Option<String>,
}

/// Deliver `signal` (default `SIGTERM`) to a live session.
pub async fn kill_bash(
    registry: &SessionRegistry,
    shell_id: &str,
    signal: Option<&str>,
) -> EngineResult<KillBashResult> {
    let session = registry.get(shell_id).await?;
    let signal = signal.unwrap_or("SIGTERM");
    let killed = session.kill(signal).await?;
    if killed {
        Ok(KillBashResult {
            killed: true,
            reason: None,
        })
    } else {
        let status = session.status().await;
        Ok(KillBashResult {
            killed: false,
            reason: Some(format!("{status:?}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalTransport;

    #[tokio::test]
    async fn foreground_reports_stdout_and_exit_code() {
        let transport = LocalTransport::new();
        let text = run_foreground(&transport, "printf hello", None).await;
        assert!(text.contains("hello"));
        assert!(text.contains("exit code 0"));
    }

    #[tokio::test]
    async fn foreground_reports_nonzero_exit_code() {
        let transport = LocalTransport::new();
        let text = run_foreground(&transport, "exit 7", None).await;
        assert!(text.contains("exit code 7"));
    }

    #[tokio::test]
    async fn background_session_completes_and_is_readable_twice() {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
        let registry = SessionRegistry::new();
        let id = run_background(&registry, transport, "printf done", None)
            .await
            .unwrap();

        // Poll briefly for completion; LocalTransport commands are fast.
        for _ in 0..50 {
            let out = bash_output(&registry, &id).await.unwrap();
            if out.status == SessionStatus::Completed {
                assert_eq!(out.exit_code, Some(0));
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let first = bash_output(&registry, &id).await.unwrap();
        assert_eq!(first.status, SessionStatus::Completed);
        let second = bash_output(&registry, &id).await.unwrap();
        assert!(second.stdout.is_empty());
        assert_eq!(second.exit_code, first.exit_code);
    }

    #[tokio::test]
    async fn kill_bash_on_running_session_then_terminal() {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
        let registry = SessionRegistry::new();
        let id = run_background(&registry, transport, "sleep 30", None)
            .await
            .unwrap();

        let result = kill_bash(&registry, &id, None).await.unwrap();
        assert!(result.killed);

        let second = kill_bash(&registry, &id, None).await.unwrap();
        assert!(!second.killed);
    }
}
