//! Optional per-session log files
//!
//! When the server is started with a log directory, each session mirrors
//! its sanitised output lines to `pty_<command_basename>_<session_id>.log`
//! in that directory. Logging is best-effort: a write failure disables the
//! writer for the rest of the session but never fails a session operation.

use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Append-only mirror of a session's sanitised output.
#[derive(Debug)]
pub struct SessionLogger {
    file: Option<File>,
    path: PathBuf,
}

impl SessionLogger {
    /// Create the log file for a session. The directory is validated at
    /// server startup, so failures here are unexpected I/O faults.
    pub async fn create(dir: &Path, command: &str, session_id: &str) -> std::io::Result<Self> {
        let basename = Path::new(command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.to_string());
        let path = dir.join(format!("pty_{basename}_{session_id}.log"));
        let file = File::create(&path).await?;
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    /// Append one completed line. Disables the writer on failure.
    pub async fn write_line(&mut self, line: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let write = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        };
        if let Err(e) = write.await {
            warn!(path = %self.path.display(), error = %e, "session log write failed, disabling logging");
            self.file = None;
        }
    }

    /// Flush and close the log file.
    pub async fn shutdown(mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
    }
}
