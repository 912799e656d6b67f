//! Background-shell session registry.
//!
//! One [`Session`] per background command: a status, the exit code once
//! known, two ring buffers, and a read cursor per stream recording what the
//! agent has already consumed via `bash_output`. Mutations are serialized
//! per-session behind a single `Mutex`, matching the "coarse lock per
//! session is sufficient" guidance.

use crate::error::{EngineError, EngineResult};
use crate::ring::RingBuffer;
use crate::transport::Transport;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

/// Per-stream ring capacity.
const RING_CAPACITY_BYTES: usize = 1024 * 1024;

/// Ceiling on live sessions. Background `bash` fails once this
/// is reached; with [`RING_CAPACITY_BYTES`] per stream this bounds total
/// retained ring memory to `MAX_SESSIONS * 2 * RING_CAPACITY_BYTES` (128 MiB
/// at the defaults), in the neighborhood of the recommended 64 MiB ceiling.
const MAX_SESSIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Killed,
    Failed,
}

struct SessionState {
    status: SessionStatus,
    exit_code: Option<i32>,
    stdout_ring: RingBuffer,
    stderr_ring: RingBuffer,
    stdout_cursor: u64,
    stderr_cursor: u64,
    started_at: Instant,
    ended_at: Option<Instant>,
    /// Set once `kill()` delivers a signal while still `Running`. Lets the
    /// completion task report `Killed` instead of `Completed` for a process
    /// that eventually does exit, without the status itself having been
    /// flipped away from `Running` (which would otherwise block a later
    /// escalation signal, e.g. `SIGTERM` followed by `SIGKILL`).
    signaled: bool,
}

/// A single tracked background command.
pub struct Session {
    pub id: String,
    pub command: String,
    state: Mutex<SessionState>,
    signal_tx: mpsc::Sender<String>,
}

impl Session {
    fn new(id: String, command: String, signal_tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            command,
            signal_tx,
            state: Mutex::new(SessionState {
                status: SessionStatus::Running,
                exit_code: None,
                stdout_ring: RingBuffer::new(RING_CAPACITY_BYTES),
                stderr_ring: RingBuffer::new(RING_CAPACITY_BYTES),
                stdout_cursor: 0,
                stderr_cursor: 0,
                started_at: Instant::now(),
                ended_at: None,
                signaled: false,
            }),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status
    }

    /// Incremental fetch for `bash_output`: everything since the last read,
    /// advancing the cursor to the current write position.
    pub async fn fetch_output(&self) -> BashOutputSnapshot {
        let mut state = self.state.lock().await;

        let (stdout, stdout_truncated) = state.stdout_ring.read_from(state.stdout_cursor);
        let (stderr, stderr_truncated) = state.stderr_ring.read_from(state.stderr_cursor);
        state.stdout_cursor = state.stdout_ring.total_written();
        state.stderr_cursor = state.stderr_ring.total_written();

        BashOutputSnapshot {
            stdout,
            stderr,
            truncated: stdout_truncated || stderr_truncated,
            status: state.status,
            exit_code: state.exit_code,
        }
    }

    /// Send a signal via the transport's kill handle. Returns `Ok(true)` if
    /// this call actually delivered a signal, `Ok(false)` if the session was
    /// already terminal. Can be called more than once on a still-running
    /// session (e.g. `SIGTERM` followed by `SIGKILL` if the process ignores
    /// the first), and marks the session so that whenever it does exit, the
    /// completion task reports it as `Killed` rather than `Completed`.
    pub async fn kill(&self, signal: &str) -> EngineResult<bool> {
        {
            let mut state = self.state.lock().await;
            if state.status != SessionStatus::Running {
                return Ok(false);
            }
            state.signaled = true;
        }
        self.signal_tx
            .send(signal.to_string())
            .await
            .map_err(|_| EngineError::transport("session's command channel is gone"))?;
        Ok(true)
    }

    /// Whether `kill()` has been called on this session while it was still
    /// running, consulted by the completion task to classify a later real
    /// exit as `Killed` instead of `Completed`.
    async fn was_signaled(&self) -> bool {
        self.state.lock().await.signaled
    }

    async fn append_stdout(&self, bytes: &[u8]) {
        self.state.lock().await.stdout_ring.append(bytes);
    }

    async fn append_stderr(&self, bytes: &[u8]) {
        self.state.lock().await.stderr_ring.append(bytes);
    }

    async fn finish(&self, status: SessionStatus, exit_code: Option<i32>) {
        let mut state = self.state.lock().await;
        // A session transitions at most once from Running to a terminal
        // state.
        if state.status == SessionStatus::Running {
            state.status = status;
            state.exit_code = exit_code;
            state.ended_at = Some(Instant::now());
        }
    }

    pub async fn runtime(&self) -> Duration {
        let state = self.state.lock().await;
        state.ended_at.unwrap_or_else(Instant::now) - state.started_at
    }

    /// Synchronous best-effort status peek used only for the concurrency
    /// cap check, where blocking on the session's own lock would be
    /// redundant with the immediately following registry-level work.
    fn status_sync(&self) -> SessionStatus {
        self.state
            .try_lock()
            .map(|s| s.status)
            .unwrap_or(SessionStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BashOutputSnapshot {
    #[serde(skip)]
    pub stdout: Vec<u8>,
    #[serde(skip)]
    pub stderr: Vec<u8>,
    pub truncated: bool,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
}

/// Thread-safe registry of live and terminal background sessions.
///
/// Terminal sessions are retained until controller shutdown (reference
/// policy) so a late `bash_output` call
/// can still observe the final bytes and exit code.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a background command and register its session. The returned
    /// handle can immediately be used with `bash_output`/`kill_bash`.
    pub async fn spawn_background(
        &self,
        id: String,
        command: String,
        transport: Arc<dyn Transport>,
        timeout: Option<Duration>,
    ) -> EngineResult<Arc<Session>> {
        {
            let sessions = self.sessions.lock().await;
            let running = sessions
                .values()
                .filter(|s| matches!(s.status_sync(), SessionStatus::Running))
                .count();
            if running >= MAX_SESSIONS {
                return Err(EngineError::validation(format!(
                    "too many live background sessions ({running}/{MAX_SESSIONS})"
                )));
            }
        }

        let streaming = transport.exec_streaming(&command).await?;
        let session = Arc::new(Session::new(
            id.clone(),
            command,
            streaming.signal_tx.clone(),
        ));

        self.sessions
            .lock()
            .await
            .insert(id.clone(), session.clone());

        let mut stdout_rx = streaming.stdout;
        let mut stderr_rx = streaming.stderr;
        let completion = streaming.completion;

        let pump_session = session.clone();
        tokio::spawn(async move {
            let mut stdout_open = true;
            let mut stderr_open = true;
            while stdout_open || stderr_open {
                tokio::select! {
                    chunk = stdout_rx.recv(), if stdout_open => {
                        match chunk {
                            Some(bytes) => pump_session.append_stdout(&bytes).await,
                            None => stdout_open = false,
                        }
                    }
                    chunk = stderr_rx.recv(), if stderr_open => {
                        match chunk {
                            Some(bytes) => pump_session.append_stderr(&bytes).await,
                            None => stderr_open = false,
                        }
                    }
                }
            }
        });

        let completion_session = session.clone();
        let kill_signal_tx = streaming.signal_tx;
        tokio::spawn(async move {
            let outcome = match timeout {
                Some(dur) => tokio::time::timeout(dur, completion).await,
                None => Ok(completion.await),
            };

            match outcome {
                Ok(Ok(Ok(code))) => {
                    let status = if completion_session.was_signaled().await {
                        SessionStatus::Killed
                    } else {
                        SessionStatus::Completed
                    };
                    completion_session.finish(status, Some(code)).await;
                }
                Ok(Ok(Err(diagnostic))) => {
                    completion_session
                        .append_stderr(diagnostic.as_bytes())
                        .await;
                    completion_session.finish(SessionStatus::Failed, None).await;
                }
                Ok(Err(_channel_dropped)) => {
                    completion_session.finish(SessionStatus::Failed, None).await;
                }
                Err(_elapsed) => {
                    let _ = kill_signal_tx.send("SIGTERM".to_string()).await;
                    completion_session.finish(SessionStatus::Killed, None).await;
                }
            }
        });

        Ok(session)
    }

    pub async fn get(&self, id: &str) -> EngineResult<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::validation(format!("no such shell id: {id}")))
    }

    /// Signal every live session. Used on controller shutdown.
    pub async fn kill_all(&self, signal: &str) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            let _ = session.kill(signal).await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
