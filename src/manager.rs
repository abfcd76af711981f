//! Process-wide session registry
//!
//! Owns every live session, enforces the concurrency cap, vends session
//! IDs, and runs the reaper task that enforces idle timeouts and sweeps
//! sessions whose child has exited. The registry lock only guards
//! insertion, removal, and enumeration; it is never held across session
//! I/O.

use crate::config::{ServerConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::session::{PtySession, SessionStatus};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cadence of the idle/exit reaper.
const REAPER_INTERVAL: Duration = Duration::from_secs(1);
/// Length of a session identifier in hex characters.
const SESSION_ID_LEN: usize = 12;

/// Point-in-time description of a session, as returned by `list`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDescriptor {
    /// Session identifier.
    pub id: String,
    /// Configured command.
    pub command: String,
    /// Lifecycle state.
    pub status: &'static str,
    /// Seconds since the last PTY read or write.
    pub seconds_since_last_activity: u64,
    /// Completed lines currently in the scrollback.
    pub buffer_lines: usize,
}

struct Registry {
    sessions: HashMap<String, Arc<PtySession>>,
    /// Every ID ever vended; IDs are never reused within a process.
    issued: HashSet<String>,
}

/// Registry of all PTY sessions in the process.
pub struct SessionManager {
    registry: Mutex<Registry>,
    config: ServerConfig,
    reaper: StdMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl SessionManager {
    /// Create a manager from a validated server configuration.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                issued: HashSet::new(),
            }),
            config,
            reaper: StdMutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Start the background reaper. Called once after construction.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => manager.reap_once().await,
                }
            }
        });
        *self.reaper.lock().unwrap() = Some(handle);
    }

    /// Create and start a new session, returning its ID.
    pub async fn create(&self, config: SessionConfig) -> Result<String> {
        let config = config.validated()?;

        let id = {
            let mut registry = self.registry.lock().await;
            if registry.sessions.len() >= self.config.max_sessions {
                return Err(Error::CapacityExceeded(self.config.max_sessions));
            }
            let id = loop {
                let candidate = new_session_id();
                if !registry.issued.contains(&candidate) {
                    break candidate;
                }
            };
            registry.issued.insert(id.clone());
            id
        };

        // Spawn outside the registry lock; re-check capacity on insert in
        // case a concurrent create raced past the first check.
        let session = PtySession::spawn(id.clone(), config, self.config.log_dir.as_deref()).await?;
        {
            let mut registry = self.registry.lock().await;
            if registry.sessions.len() >= self.config.max_sessions {
                drop(registry);
                let _ = session.stop().await;
                return Err(Error::CapacityExceeded(self.config.max_sessions));
            }
            registry.sessions.insert(id.clone(), session);
        }
        Ok(id)
    }

    /// Look up a session by ID.
    pub async fn get(&self, id: &str) -> Result<Arc<PtySession>> {
        self.registry
            .lock()
            .await
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownSession(id.to_string()))
    }

    /// Stop a session and remove it from the registry. Stopping an ID that
    /// was vended but already reaped is a success (idempotent stop); an ID
    /// this process never vended is `UnknownSession`.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let session = {
            let mut registry = self.registry.lock().await;
            match registry.sessions.remove(id) {
                Some(session) => session,
                None if registry.issued.contains(id) => return Ok(()),
                None => return Err(Error::UnknownSession(id.to_string())),
            }
        };
        session.stop().await
    }

    /// Descriptors for every non-stopped session.
    pub async fn list(&self) -> Vec<SessionDescriptor> {
        let sessions: Vec<Arc<PtySession>> =
            self.registry.lock().await.sessions.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            let status = session.status();
            if status == SessionStatus::Stopped {
                continue;
            }
            out.push(SessionDescriptor {
                id: session.id().to_string(),
                command: session.command().to_string(),
                status: status.as_str(),
                seconds_since_last_activity: session.idle_for().as_secs(),
                buffer_lines: session.buffer_line_count().await,
            });
        }
        out
    }

    /// Number of registered sessions.
    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.sessions.len()
    }

    /// One reaper pass: stop sessions past their idle timeout, finish
    /// cleaning up sessions whose child exited, and drop stopped ones.
    async fn reap_once(&self) {
        let snapshot: Vec<(String, Arc<PtySession>)> = {
            let registry = self.registry.lock().await;
            registry
                .sessions
                .iter()
                .map(|(id, s)| (id.clone(), Arc::clone(s)))
                .collect()
        };

        let mut expired = Vec::new();
        for (id, session) in snapshot {
            match session.status() {
                SessionStatus::Stopped => expired.push(id),
                SessionStatus::Stopping => {
                    // Child exited on its own; run the normal shutdown path.
                    debug!(session_id = %id, "reaping session after child exit");
                    let _ = session.stop().await;
                    expired.push(id);
                }
                _ => {
                    if session.idle_for() >= session.idle_timeout() {
                        info!(session_id = %id, "session idle timeout reached, stopping");
                        if let Err(e) = session.stop().await {
                            warn!(session_id = %id, error = %e, "failed to stop idle session");
                        }
                        expired.push(id);
                    }
                }
            }
        }

        if !expired.is_empty() {
            let mut registry = self.registry.lock().await;
            for id in expired {
                registry.sessions.remove(&id);
            }
        }
    }

    /// Stop every session in parallel and clear the registry. Called at
    /// process exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let reaper = self.reaper.lock().unwrap().take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }

        let sessions: Vec<Arc<PtySession>> = {
            let mut registry = self.registry.lock().await;
            registry.sessions.drain().map(|(_, s)| s).collect()
        };
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "stopping all sessions");
        let mut tasks = JoinSet::new();
        for session in sessions {
            tasks.spawn(async move {
                let _ = session.stop().await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}

/// 12 hex characters from a v4 UUID.
fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(SESSION_ID_LEN);
    id
}
