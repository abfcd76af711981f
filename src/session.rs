//! PTY session core
//!
//! Each session owns one child process attached to a PTY, a read pump task
//! that continuously drains the master side through the sanitiser into the
//! scrollback buffer, and the sentinel machinery that turns an unframed
//! byte stream into detectable command completion.
//!
//! Ownership is deliberately one-way: the pump task holds only the shared
//! inner state and a cancellation token, never the session itself, so
//! `stop` can always cancel and join the pump without a cycle.

use crate::buffer::ScrollbackBuffer;
use crate::config::{SessionConfig, SENTINEL_PLACEHOLDER};
use crate::error::{Error, Result};
use crate::logger::SessionLogger;
use crate::sanitize::sanitize;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bytes requested per PTY read.
const READ_CHUNK_BYTES: usize = 64 * 1024;
/// Length of the per-command sentinel token.
const SENTINEL_TOKEN_LEN: usize = 32;
/// Grace period between SIGTERM and SIGKILL.
const CHILD_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle state of a session. Transitions are monotonic; `Stopped` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Spawn in progress.
    Starting,
    /// Child alive, pump running.
    Running,
    /// Shutdown initiated (explicit stop, idle timeout, or child exit).
    Stopping,
    /// Child reaped, pump joined, resources released.
    Stopped,
}

impl SessionStatus {
    /// String form used in descriptors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// Output of a completed or timed-out `run_command`.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Sanitised output with command and sentinel echoes removed.
    pub output: String,
    /// True when the sentinel was not observed before the deadline. The
    /// command is still executing in the child; the session stays running.
    pub timed_out: bool,
}

/// A registered completion waiter. The pump fulfils it with the absolute
/// buffer index of the line carrying the sentinel token.
struct Waiter {
    token: String,
    sentinel_cmd: String,
    tx: oneshot::Sender<u64>,
}

/// State shared between the session handle and its pump task.
struct Shared {
    inner: Mutex<Inner>,
    status: StdMutex<SessionStatus>,
    last_activity: StdMutex<Instant>,
}

struct Inner {
    buffer: ScrollbackBuffer,
    sentinel_template: String,
    waiters: Vec<Waiter>,
    logger: Option<SessionLogger>,
}

impl Inner {
    /// Append sanitised text, mirror completed lines to the log, and wake
    /// waiters whose token shows up in a non-echo line.
    async fn ingest(&mut self, text: &str) {
        let completed = self.buffer.append(text);
        if let Some(logger) = self.logger.as_mut() {
            for line in &completed {
                logger.write_line(line).await;
            }
        }
        if completed.is_empty() || self.waiters.is_empty() {
            return;
        }
        let base = self.buffer.total_lines() - completed.len() as u64;
        let mut remaining = Vec::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            let hit = completed.iter().enumerate().find_map(|(i, line)| {
                (line.contains(&waiter.token) && !is_echo_line(line, &waiter.sentinel_cmd))
                    .then_some(base + i as u64)
            });
            match hit {
                Some(idx) => {
                    let _ = waiter.tx.send(idx);
                }
                None => remaining.push(waiter),
            }
        }
        self.waiters = remaining;
    }

    fn remove_waiter(&mut self, token: &str) {
        self.waiters.retain(|w| w.token != token);
    }
}

/// One child process under a PTY, with its read pump and scrollback.
pub struct PtySession {
    id: String,
    config: SessionConfig,
    pid: Option<u32>,
    shared: Arc<Shared>,
    writer: Mutex<Option<pty_process::OwnedWritePty>>,
    child: Mutex<Option<Child>>,
    /// Serialises `run_command` calls: at most one active command.
    command_gate: Mutex<()>,
    /// Serialises `stop` so concurrent callers cannot double-clean.
    stop_gate: Mutex<()>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl PtySession {
    /// Allocate a PTY, spawn the configured command on its slave side, and
    /// start the read pump. The config must already be validated.
    pub(crate) async fn spawn(
        id: String,
        config: SessionConfig,
        log_dir: Option<&Path>,
    ) -> Result<Arc<Self>> {
        let (pty, pts) = pty_process::open().map_err(|e| Error::SpawnFailed(e.to_string()))?;
        // Interactive programs misbehave on a 0x0 terminal.
        if let Err(e) = pty.resize(pty_process::Size::new(24, 80)) {
            warn!(session_id = %id, error = %e, "could not set pty window size");
        }

        let mut cmd = pty_process::Command::new(&config.command);
        if !config.args.is_empty() {
            cmd = cmd.args(&config.args);
        }
        if let Some(dir) = &config.cwd {
            cmd = cmd.current_dir(dir);
        }
        cmd = cmd.env("TERM", "xterm-256color");

        let child = cmd.spawn(pts).map_err(|e| Error::SpawnFailed(e.to_string()))?;
        let pid = child.id();
        let (reader, writer) = pty.into_split();

        let logger = match log_dir {
            Some(dir) => match SessionLogger::create(dir, &config.command, &id).await {
                Ok(logger) => Some(logger),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "could not create session log file");
                    None
                }
            },
            None => None,
        };

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                buffer: ScrollbackBuffer::new(config.buffer_lines),
                sentinel_template: config.sentinel_template.clone(),
                waiters: Vec::new(),
                logger,
            }),
            status: StdMutex::new(SessionStatus::Starting),
            last_activity: StdMutex::new(Instant::now()),
        });

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(run_pump(
            Arc::clone(&shared),
            reader,
            cancel.clone(),
            id.clone(),
        ));

        let session = Arc::new(Self {
            id,
            config,
            pid,
            shared,
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            command_gate: Mutex::new(()),
            stop_gate: Mutex::new(()),
            pump: StdMutex::new(Some(pump)),
            cancel,
        });
        session.set_status(SessionStatus::Running);
        info!(
            session_id = %session.id,
            command = %session.config.command,
            pid = session.pid,
            "session started"
        );
        Ok(session)
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configured command.
    pub fn command(&self) -> &str {
        &self.config.command
    }

    /// Child PID as recorded at spawn.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SessionStatus {
        *self.shared.status.lock().unwrap()
    }

    fn set_status(&self, status: SessionStatus) {
        *self.shared.status.lock().unwrap() = status;
    }

    /// Time since the last read from or write to the PTY.
    pub fn idle_for(&self) -> Duration {
        self.shared.last_activity.lock().unwrap().elapsed()
    }

    /// Configured idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }

    /// Completed lines currently held in the scrollback.
    pub async fn buffer_line_count(&self) -> usize {
        self.shared.inner.lock().await.buffer.line_count()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.status() == SessionStatus::Running {
            Ok(())
        } else {
            Err(Error::SessionNotRunning(self.id.clone()))
        }
    }

    /// Submit a command line and wait for the sentinel to show up in the
    /// sanitised output. Returns everything the child printed between
    /// submission and the sentinel, with echoes filtered. On deadline the
    /// accumulated output is returned with `timed_out` set and the session
    /// stays running; the waiter is detached but the command keeps
    /// executing in the child.
    pub async fn run_command(&self, text: &str, timeout: Duration) -> Result<CommandOutput> {
        self.ensure_running()?;
        let _turn = self.command_gate.lock().await;
        self.ensure_running()?;

        let (token, sentinel_cmd, mark, rx) = {
            let mut inner = self.shared.inner.lock().await;
            let token = sentinel_token();
            let sentinel_cmd = inner
                .sentinel_template
                .replace(SENTINEL_PLACEHOLDER, &token);
            let mark = inner.buffer.total_lines();
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(Waiter {
                token: token.clone(),
                sentinel_cmd: sentinel_cmd.clone(),
                tx,
            });
            (token, sentinel_cmd, mark, rx)
        };

        let payload = format!("{text}\n{sentinel_cmd}\n");
        if let Err(e) = self.write_bytes(payload.as_bytes()).await {
            self.shared.inner.lock().await.remove_waiter(&token);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(sentinel_line)) => {
                let inner = self.shared.inner.lock().await;
                let lines = inner.buffer.range(mark, sentinel_line);
                Ok(CommandOutput {
                    output: filter_echoes(&lines, text, &sentinel_cmd, &token),
                    timed_out: false,
                })
            }
            // Sender dropped: the pump observed closure while we waited.
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                let mut inner = self.shared.inner.lock().await;
                inner.remove_waiter(&token);
                let lines = inner.buffer.lines_since(mark);
                debug!(session_id = %self.id, "run_command deadline reached");
                Ok(CommandOutput {
                    output: filter_echoes(&lines, text, &sentinel_cmd, &token),
                    timed_out: true,
                })
            }
        }
    }

    /// Write caller-supplied bytes verbatim to the PTY master. No echo
    /// filtering and no completion wait.
    pub async fn send_keys(&self, keys: &str) -> Result<()> {
        self.ensure_running()?;
        self.write_bytes(keys.as_bytes()).await
    }

    /// Snapshot of the scrollback tail. Allowed in any state.
    pub async fn get_buffer(&self, lines: Option<usize>) -> String {
        self.shared.inner.lock().await.buffer.tail(lines)
    }

    /// Swap the sentinel template, e.g. when the agent launches a REPL
    /// inside the session.
    pub async fn set_sentinel(&self, template: &str) -> Result<()> {
        self.ensure_running()?;
        crate::config::validate_sentinel_template(template)?;
        self.shared.inner.lock().await.sentinel_template = template.to_string();
        Ok(())
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(Error::SessionNotRunning(self.id.clone()));
        };
        w.write_all(bytes).await?;
        w.flush().await?;
        *self.shared.last_activity.lock().unwrap() = Instant::now();
        Ok(())
    }

    /// Stop the session: terminate the child (SIGTERM, grace, SIGKILL),
    /// close the PTY master, join the pump, reap, and release the log
    /// writer. Idempotent; stopping a stopped session succeeds.
    pub async fn stop(&self) -> Result<()> {
        let _gate = self.stop_gate.lock().await;
        if self.status() == SessionStatus::Stopped {
            return Ok(());
        }
        self.set_status(SessionStatus::Stopping);

        self.cancel.cancel();
        let pump = self.pump.lock().unwrap().take();
        if let Some(handle) = pump {
            let _ = handle.await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            terminate_child(&mut child, &self.id).await;
        }

        // Dropping the write half closes our last handle on the master.
        self.writer.lock().await.take();

        {
            let mut inner = self.shared.inner.lock().await;
            inner.waiters.clear();
            if let Some(logger) = inner.logger.take() {
                logger.shutdown().await;
            }
        }

        self.set_status(SessionStatus::Stopped);
        info!(session_id = %self.id, "session stopped");
        Ok(())
    }
}

/// Read pump: drain the PTY master through the sanitiser into the buffer
/// until EOF, error, or cancellation. On closure the session is marked
/// stopping and all waiters are released; final cleanup belongs to `stop`.
async fn run_pump(
    shared: Arc<Shared>,
    mut reader: pty_process::OwnedReadPty,
    cancel: CancellationToken,
    session_id: String,
) {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!(session_id = %session_id, "pty read pump saw eof");
                    mark_closed(&shared).await;
                    break;
                }
                Ok(n) => {
                    let mut input = std::mem::take(&mut pending);
                    input.extend_from_slice(&chunk[..n]);
                    let (text, residue) = sanitize(&input);
                    pending = residue;
                    *shared.last_activity.lock().unwrap() = Instant::now();
                    if !text.is_empty() {
                        shared.inner.lock().await.ingest(&text).await;
                    }
                }
                // EIO is how the kernel reports a gone child on Linux.
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "pty read pump terminated");
                    mark_closed(&shared).await;
                    break;
                }
            }
        }
    }
}

/// The child is gone: advance to stopping and release every waiter so
/// in-flight `run_command` calls observe cancellation.
async fn mark_closed(shared: &Shared) {
    {
        let mut status = shared.status.lock().unwrap();
        if matches!(*status, SessionStatus::Starting | SessionStatus::Running) {
            *status = SessionStatus::Stopping;
        }
    }
    shared.inner.lock().await.waiters.clear();
}

/// SIGTERM the child, give it a grace period, SIGKILL if it is still
/// around, then reap. Signals target the child's specific PID only.
async fn terminate_child(child: &mut Child, session_id: &str) {
    if let Some(raw) = child.id() {
        let pid = Pid::from_raw(raw as i32);
        debug!(session_id = %session_id, pid = raw, "sending SIGTERM");
        let _ = kill(pid, Signal::SIGTERM);

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {}
                Err(_) => break,
            }
            if start.elapsed() >= CHILD_GRACE {
                debug!(session_id = %session_id, pid = raw, "grace period expired, sending SIGKILL");
                let _ = kill(pid, Signal::SIGKILL);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    let _ = child.wait().await;
}

/// Fresh random token for one `run_command` invocation.
fn sentinel_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SENTINEL_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// True when a line carrying the sentinel token is the terminal's echo of
/// the sentinel command rather than the interpreter's own output.
fn is_echo_line(line: &str, sentinel_cmd: &str) -> bool {
    let t = line.trim();
    let s = sentinel_cmd.trim();
    t == s || t.ends_with(s)
}

/// Drop command and sentinel echoes from captured output. Only lines that
/// are unambiguously echoes are removed; anything else is retained.
fn filter_echoes(lines: &[String], command: &str, sentinel_cmd: &str, token: &str) -> String {
    let cmd = command.lines().next().unwrap_or("").trim();
    let sentinel = sentinel_cmd.trim();
    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.contains(token) {
            continue;
        }
        let t = line.trim();
        if !cmd.is_empty() && (t == cmd || t.ends_with(cmd)) {
            continue;
        }
        if t == sentinel || t.ends_with(sentinel) {
            continue;
        }
        kept.push(line.as_str());
    }
    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sentinel_token_shape() {
        let a = sentinel_token();
        let b = sentinel_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_filter_drops_command_echo() {
        let captured = lines(&["echo hello", "hello", "TOK123"]);
        let out = filter_echoes(&captured, "echo hello", "echo TOK123", "TOK123");
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_filter_drops_prompt_prefixed_echo() {
        let captured = lines(&["user@host:~$ echo hello", "hello", "user@host:~$ echo TOK123", "TOK123"]);
        let out = filter_echoes(&captured, "echo hello", "echo TOK123", "TOK123");
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_filter_keeps_ordinary_output() {
        let captured = lines(&["total 4", "drwxr-xr-x 2 u u 4096 . src", ""]);
        let out = filter_echoes(&captured, "ls -l", "echo TOK123", "TOK123");
        assert_eq!(out, "total 4\ndrwxr-xr-x 2 u u 4096 . src\n");
    }

    #[test]
    fn test_filter_multiline_command_only_drops_first_line() {
        let captured = lines(&["for i in 1 2; do", "echo $i", "done", "1", "2"]);
        let out = filter_echoes(
            &captured,
            "for i in 1 2; do\necho $i\ndone",
            "echo TOK123",
            "TOK123",
        );
        // Later command-line echoes are retained: under-filtering is the
        // safe direction.
        assert_eq!(out, "echo $i\ndone\n1\n2");
    }

    #[test]
    fn test_echo_line_detection() {
        assert!(is_echo_line("echo TOK123", "echo TOK123"));
        assert!(is_echo_line(">>> print('TOK123')", "print('TOK123')"));
        assert!(!is_echo_line("TOK123", "echo TOK123"));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(SessionStatus::Running.as_str(), "running");
        assert_eq!(SessionStatus::Stopped.as_str(), "stopped");
    }
}
