//! Session and server configuration types

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Idle timeout applied when a session does not specify one.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 86_400;
/// Scrollback capacity in completed lines.
pub const DEFAULT_BUFFER_LINES: usize = 1_000;
/// How long `run_command` waits for the sentinel by default.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 1_800;
/// Maximum concurrent sessions per process.
pub const DEFAULT_MAX_SESSIONS: usize = 10;
/// Shell used when neither the caller nor `$SHELL` names one.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Placeholder that sentinel templates must contain exactly once.
pub const SENTINEL_PLACEHOLDER: &str = "{sentinel}";
/// Sentinel template suitable for POSIX shells.
pub const DEFAULT_SENTINEL_TEMPLATE: &str = "echo {sentinel}";

/// Configuration for a single PTY session. Immutable once the session has
/// started, except for the sentinel template which `set_sentinel` swaps.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Executable to run (absolute or PATH-resolvable).
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory for the child, if any.
    pub cwd: Option<PathBuf>,
    /// Idle timeout after which the session is reaped.
    pub idle_timeout: Duration,
    /// Scrollback capacity in completed lines.
    pub buffer_lines: usize,
    /// Template used to make the interpreter print the sentinel token.
    pub sentinel_template: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: default_shell(),
            args: Vec::new(),
            cwd: None,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            buffer_lines: DEFAULT_BUFFER_LINES,
            sentinel_template: DEFAULT_SENTINEL_TEMPLATE.to_string(),
        }
    }
}

impl SessionConfig {
    /// Validate and normalise the configuration.
    ///
    /// When `args` is empty and `command` contains whitespace, the command
    /// string is tokenised by POSIX shell-word splitting; the first token
    /// becomes the executable and the rest become `args`.
    pub fn validated(mut self) -> Result<Self> {
        if self.command.trim().is_empty() {
            return Err(Error::InvalidConfig("command must not be empty".into()));
        }
        if self.args.is_empty() && self.command.trim().contains(char::is_whitespace) {
            let mut words = shell_words::split(&self.command)
                .map_err(|e| Error::InvalidConfig(format!("unparseable command: {e}")))?;
            if words.is_empty() {
                return Err(Error::InvalidConfig("command must not be empty".into()));
            }
            self.command = words.remove(0);
            self.args = words;
        }
        if self.buffer_lines == 0 {
            return Err(Error::InvalidConfig("buffer_lines must be at least 1".into()));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "idle timeout must be greater than zero".into(),
            ));
        }
        validate_sentinel_template(&self.sentinel_template)?;
        Ok(self)
    }
}

/// Resolve the default session command from `$SHELL`.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| DEFAULT_SHELL.to_string())
}

/// Check that a sentinel template contains the `{sentinel}` placeholder
/// exactly once. A template with several placeholders would make completion
/// detection ambiguous, so it is rejected rather than guessed at.
pub fn validate_sentinel_template(template: &str) -> Result<()> {
    match template.matches(SENTINEL_PLACEHOLDER).count() {
        1 => Ok(()),
        0 => Err(Error::InvalidSentinel(format!(
            "template must contain {SENTINEL_PLACEHOLDER}"
        ))),
        n => Err(Error::InvalidSentinel(format!(
            "template contains {SENTINEL_PLACEHOLDER} {n} times, expected exactly one"
        ))),
    }
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    /// Directory for per-session log files. Must already exist.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Validate process-level knobs. A missing log directory is a fatal
    /// startup error, not something to create on the fly.
    pub fn validated(self) -> Result<Self> {
        if self.max_sessions == 0 {
            return Err(Error::InvalidConfig("max_sessions must be at least 1".into()));
        }
        if let Some(dir) = &self.log_dir {
            if !dir.is_dir() {
                return Err(Error::InvalidConfig(format!(
                    "log directory does not exist: {}",
                    dir.display()
                )));
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.buffer_lines, DEFAULT_BUFFER_LINES);
        assert_eq!(config.idle_timeout, Duration::from_secs(86_400));
        assert_eq!(config.sentinel_template, "echo {sentinel}");
        assert!(!config.command.is_empty());
    }

    #[test]
    fn test_command_tokenisation() {
        let config = SessionConfig {
            command: "python3 -u -i".to_string(),
            ..SessionConfig::default()
        }
        .validated()
        .unwrap();
        assert_eq!(config.command, "python3");
        assert_eq!(config.args, vec!["-u", "-i"]);
    }

    #[test]
    fn test_command_tokenisation_respects_quotes() {
        let config = SessionConfig {
            command: "sh -c 'echo hi'".to_string(),
            ..SessionConfig::default()
        }
        .validated()
        .unwrap();
        assert_eq!(config.command, "sh");
        assert_eq!(config.args, vec!["-c", "echo hi"]);
    }

    #[test]
    fn test_explicit_args_suppress_tokenisation() {
        let config = SessionConfig {
            command: "some command with spaces".to_string(),
            args: vec!["-x".to_string()],
            ..SessionConfig::default()
        }
        .validated()
        .unwrap();
        assert_eq!(config.command, "some command with spaces");
    }

    #[test]
    fn test_empty_command_rejected() {
        let result = SessionConfig {
            command: "  ".to_string(),
            ..SessionConfig::default()
        }
        .validated();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let result = SessionConfig {
            buffer_lines: 0,
            ..SessionConfig::default()
        }
        .validated();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_sentinel_template_validation() {
        assert!(validate_sentinel_template("echo {sentinel}").is_ok());
        assert!(validate_sentinel_template("print('{sentinel}')").is_ok());
        assert!(matches!(
            validate_sentinel_template("echo done"),
            Err(Error::InvalidSentinel(_))
        ));
        assert!(matches!(
            validate_sentinel_template("echo {sentinel} {sentinel}"),
            Err(Error::InvalidSentinel(_))
        ));
    }

    #[test]
    fn test_server_config_rejects_missing_log_dir() {
        let result = ServerConfig {
            max_sessions: 10,
            log_dir: Some(PathBuf::from("/definitely/not/a/real/dir")),
        }
        .validated();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
