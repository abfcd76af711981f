//! Tool façade over the session manager
//!
//! Translates the named tool operations and their loosely typed JSON
//! argument maps into strongly typed core calls. Each operation is a
//! `Tool` implementation carrying its own JSON schema; the `Toolbox`
//! registers all of them and dispatches by name.

use crate::config::{
    SessionConfig, DEFAULT_BUFFER_LINES, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_SENTINEL_TEMPLATE,
};
use crate::error::{Error, Result};
use crate::manager::SessionManager;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Tool metadata and input schema, in the wire shape used by `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema for the argument map.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Result of a tool execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    /// Whether execution succeeded.
    pub success: bool,
    /// Output data.
    pub output: Value,
    /// Error message if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// Create a successful result.
    #[must_use]
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    /// Create a failed result.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Trait for tool implementations.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given argument map.
    async fn execute(&self, args: &Value) -> Result<ToolResult>;
}

// ── Argument extraction ──────────────────────────────────────────────

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    match args.get(key) {
        Some(v) => v
            .as_str()
            .ok_or_else(|| Error::InvalidConfig(format!("'{key}' must be a string"))),
        None => Err(Error::InvalidConfig(format!("missing required '{key}'"))),
    }
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Result<Option<&'a str>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| Error::InvalidConfig(format!("'{key}' must be a string"))),
    }
}

fn optional_u64(args: &Value, key: &str) -> Result<Option<u64>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| Error::InvalidConfig(format!("'{key}' must be a non-negative integer"))),
    }
}

fn optional_f64(args: &Value, key: &str) -> Result<Option<f64>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|f| *f >= 0.0)
            .map(Some)
            .ok_or_else(|| Error::InvalidConfig(format!("'{key}' must be a non-negative number"))),
    }
}

fn optional_str_array(args: &Value, key: &str) -> Result<Option<Vec<String>>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::InvalidConfig(format!("'{key}' must be an array of strings")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(_) => Err(Error::InvalidConfig(format!(
            "'{key}' must be an array of strings"
        ))),
    }
}

/// Decode the conventional escape sequences (`\n`, `\r`, `\t`, `\\`,
/// `\xNN`) in a `send_keys` payload. Unrecognised escapes pass through
/// untouched so callers are never surprised by silent drops.
pub(crate) fn decode_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('n') => {
                chars.next();
                out.push('\n');
            }
            Some('r') => {
                chars.next();
                out.push('\r');
            }
            Some('t') => {
                chars.next();
                out.push('\t');
            }
            Some('\\') => {
                chars.next();
                out.push('\\');
            }
            Some('x') => {
                let mut lookahead = chars.clone();
                lookahead.next();
                let hi = lookahead.next();
                let lo = lookahead.next();
                match (hi, lo) {
                    (Some(hi), Some(lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                        let byte = (hi.to_digit(16).unwrap() * 16 + lo.to_digit(16).unwrap()) as u8;
                        out.push(byte as char);
                        chars = lookahead;
                    }
                    _ => out.push('\\'),
                }
            }
            _ => out.push('\\'),
        }
    }
    out
}

// ── Tools ────────────────────────────────────────────────────────────

/// Tool for starting a new PTY session.
pub struct StartSessionTool {
    manager: Arc<SessionManager>,
}

#[async_trait]
impl Tool for StartSessionTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "start_session".to_string(),
            description: "Start a new PTY session. Returns a session_id to use with the other tools."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "Executable to run (default: $SHELL, else /bin/bash). A string with spaces and no explicit args is shell-word split."
                    },
                    "args": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Arguments for the command"
                    },
                    "cwd": {
                        "type": "string",
                        "description": "Working directory for the session"
                    },
                    "timeout_session": {
                        "type": "integer",
                        "description": format!("Idle timeout in seconds (default {DEFAULT_IDLE_TIMEOUT_SECS})")
                    },
                    "buffer_size": {
                        "type": "integer",
                        "description": format!("Scrollback size in lines (default {DEFAULT_BUFFER_LINES})")
                    },
                    "sentinel_command": {
                        "type": "string",
                        "description": format!("Completion template containing {{sentinel}} (default '{DEFAULT_SENTINEL_TEMPLATE}'). For a Python REPL: \"print('{{sentinel}}')\"")
                    }
                }
            }),
        }
    }

    async fn execute(&self, args: &Value) -> Result<ToolResult> {
        let defaults = SessionConfig::default();
        let config = SessionConfig {
            command: optional_str(args, "command")?
                .map(str::to_string)
                .unwrap_or(defaults.command),
            args: optional_str_array(args, "args")?.unwrap_or_default(),
            cwd: optional_str(args, "cwd")?.map(PathBuf::from),
            idle_timeout: optional_u64(args, "timeout_session")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            buffer_lines: optional_u64(args, "buffer_size")?
                .map(|n| n as usize)
                .unwrap_or(defaults.buffer_lines),
            sentinel_template: optional_str(args, "sentinel_command")?
                .map(str::to_string)
                .unwrap_or(defaults.sentinel_template),
        };
        let id = self.manager.create(config).await?;
        Ok(ToolResult::success(json!({ "session_id": id })))
    }
}

/// Tool for running a command and waiting for sentinel-detected completion.
pub struct RunCommandTool {
    manager: Arc<SessionManager>,
}

#[async_trait]
impl Tool for RunCommandTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "run_command".to_string(),
            description: "Run a command in a PTY session and wait for it to finish. \
                          Completion is detected by watching the output for a per-call sentinel token."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": {
                        "type": "string",
                        "description": "Session ID returned by start_session"
                    },
                    "command": {
                        "type": "string",
                        "description": "Command line to submit"
                    },
                    "timeout": {
                        "type": "number",
                        "description": format!("Seconds to wait for completion (default {DEFAULT_COMMAND_TIMEOUT_SECS}). On timeout the partial output is returned and the command keeps running.")
                    }
                },
                "required": ["session_id", "command"]
            }),
        }
    }

    async fn execute(&self, args: &Value) -> Result<ToolResult> {
        let session_id = required_str(args, "session_id")?;
        let command = required_str(args, "command")?;
        let timeout = optional_f64(args, "timeout")?
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS));

        let session = self.manager.get(session_id).await?;
        let result = session.run_command(command, timeout).await?;
        Ok(ToolResult::success(json!({
            "session_id": session_id,
            "output": result.output,
            "timed_out": result.timed_out,
        })))
    }
}

/// Tool for sending raw input to a session without waiting.
pub struct SendKeysTool {
    manager: Arc<SessionManager>,
}

#[async_trait]
impl Tool for SendKeysTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "send_keys".to_string(),
            description: "Send raw input to a PTY session without waiting for completion. \
                          Use \\n for Enter, \\x03 for Ctrl+C, \\x04 for Ctrl+D."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": {
                        "type": "string",
                        "description": "The session ID"
                    },
                    "keys": {
                        "type": "string",
                        "description": "Input to send, with \\n / \\r / \\t / \\xNN escapes"
                    }
                },
                "required": ["session_id", "keys"]
            }),
        }
    }

    async fn execute(&self, args: &Value) -> Result<ToolResult> {
        let session_id = required_str(args, "session_id")?;
        let keys = decode_escapes(required_str(args, "keys")?);

        let session = self.manager.get(session_id).await?;
        session.send_keys(&keys).await?;
        Ok(ToolResult::success(json!({
            "session_id": session_id,
            "bytes_written": keys.len(),
        })))
    }
}

/// Tool for reading the scrollback buffer.
pub struct GetBufferTool {
    manager: Arc<SessionManager>,
}

#[async_trait]
impl Tool for GetBufferTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_buffer".to_string(),
            description: "Read the scrollback buffer of a PTY session.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": {
                        "type": "string",
                        "description": "The session ID"
                    },
                    "lines": {
                        "type": "integer",
                        "description": "Number of lines from the end of the buffer. Omit for the full buffer."
                    }
                },
                "required": ["session_id"]
            }),
        }
    }

    async fn execute(&self, args: &Value) -> Result<ToolResult> {
        let session_id = required_str(args, "session_id")?;
        let lines = optional_u64(args, "lines")?.map(|n| n as usize);

        let session = self.manager.get(session_id).await?;
        let content = session.get_buffer(lines).await;
        Ok(ToolResult::success(json!({
            "session_id": session_id,
            "content": content,
        })))
    }
}

/// Tool for swapping the sentinel template of a session.
pub struct SetSentinelTool {
    manager: Arc<SessionManager>,
}

#[async_trait]
impl Tool for SetSentinelTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "set_sentinel".to_string(),
            description: "Change the completion sentinel template for a session, e.g. after \
                          launching a REPL inside it. The template must contain {sentinel} exactly once."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": {
                        "type": "string",
                        "description": "The session ID"
                    },
                    "sentinel_command": {
                        "type": "string",
                        "description": "New template, e.g. 'echo {sentinel}' (shell) or \"print('{sentinel}')\" (python)"
                    }
                },
                "required": ["session_id", "sentinel_command"]
            }),
        }
    }

    async fn execute(&self, args: &Value) -> Result<ToolResult> {
        let session_id = required_str(args, "session_id")?;
        let template = required_str(args, "sentinel_command")?;

        let session = self.manager.get(session_id).await?;
        session.set_sentinel(template).await?;
        Ok(ToolResult::success(json!({
            "session_id": session_id,
            "sentinel_command": template,
        })))
    }
}

/// Tool for stopping and removing a session.
pub struct StopSessionTool {
    manager: Arc<SessionManager>,
}

#[async_trait]
impl Tool for StopSessionTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "stop_session".to_string(),
            description: "Stop a PTY session and release its process and buffers.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": {
                        "type": "string",
                        "description": "The session ID to stop"
                    }
                },
                "required": ["session_id"]
            }),
        }
    }

    async fn execute(&self, args: &Value) -> Result<ToolResult> {
        let session_id = required_str(args, "session_id")?;
        self.manager.remove(session_id).await?;
        Ok(ToolResult::success(json!({
            "session_id": session_id,
            "status": "stopped",
        })))
    }
}

/// Tool for listing active sessions.
pub struct ListSessionsTool {
    manager: Arc<SessionManager>,
}

#[async_trait]
impl Tool for ListSessionsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_sessions".to_string(),
            description: "List all active PTY sessions.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        }
    }

    async fn execute(&self, _args: &Value) -> Result<ToolResult> {
        let sessions = self.manager.list().await;
        Ok(ToolResult::success(json!({
            "count": sessions.len(),
            "sessions": sessions,
        })))
    }
}

// ── Toolbox ──────────────────────────────────────────────────────────

/// Registry of all PTY tools, dispatching calls by name.
pub struct Toolbox {
    tools: Vec<Arc<dyn Tool>>,
}

impl Toolbox {
    /// Build the toolbox with every PTY tool registered.
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(StartSessionTool {
                manager: Arc::clone(&manager),
            }),
            Arc::new(RunCommandTool {
                manager: Arc::clone(&manager),
            }),
            Arc::new(SendKeysTool {
                manager: Arc::clone(&manager),
            }),
            Arc::new(GetBufferTool {
                manager: Arc::clone(&manager),
            }),
            Arc::new(SetSentinelTool {
                manager: Arc::clone(&manager),
            }),
            Arc::new(StopSessionTool {
                manager: Arc::clone(&manager),
            }),
            Arc::new(ListSessionsTool { manager }),
        ];
        Self { tools }
    }

    /// Definitions of every registered tool, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Dispatch a call by tool name.
    pub async fn call(&self, name: &str, args: &Value) -> Result<ToolResult> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.definition().name == name)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown tool: {name}")))?;
        tool.execute(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn toolbox() -> Toolbox {
        Toolbox::new(SessionManager::new(ServerConfig::default()))
    }

    #[test]
    fn test_definitions_cover_all_operations() {
        let names: Vec<String> = toolbox()
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "start_session",
                "run_command",
                "send_keys",
                "get_buffer",
                "set_sentinel",
                "stop_session",
                "list_sessions"
            ]
        );
    }

    #[test]
    fn test_decode_escapes() {
        assert_eq!(decode_escapes("plain"), "plain");
        assert_eq!(decode_escapes("a\\nb"), "a\nb");
        assert_eq!(decode_escapes("\\x03"), "\x03");
        assert_eq!(decode_escapes("\\x04"), "\x04");
        assert_eq!(decode_escapes("\\\\n"), "\\n");
        assert_eq!(decode_escapes("tab\\there"), "tab\there");
        // Unrecognised escapes pass through untouched.
        assert_eq!(decode_escapes("\\q"), "\\q");
        assert_eq!(decode_escapes("\\xZZ"), "\\xZZ");
        // Trailing backslash survives.
        assert_eq!(decode_escapes("end\\"), "end\\");
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let result = toolbox().call("format_disk", &json!({})).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_missing_required_argument() {
        let result = toolbox().call("run_command", &json!({})).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        let result = toolbox()
            .call("run_command", &json!({"session_id": "abc"}))
            .await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_wrong_argument_type() {
        let result = toolbox()
            .call("get_buffer", &json!({"session_id": "abc", "lines": "ten"}))
            .await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_unknown_session_errors() {
        let result = toolbox()
            .call(
                "run_command",
                &json!({"session_id": "000000000000", "command": "true"}),
            )
            .await;
        assert!(matches!(result, Err(Error::UnknownSession(_))));
    }

    #[tokio::test]
    async fn test_list_sessions_empty() {
        let result = toolbox().call("list_sessions", &json!({})).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["count"], 0);
    }
}
