//! JSON-RPC 2.0 stdio server
//!
//! Speaks the MCP wire shape over newline-delimited JSON on stdin/stdout:
//! `initialize`, `tools/list`, and `tools/call`. Tool-level failures are
//! reported as `isError` content so the caller can read them; only
//! malformed requests become JSON-RPC errors. All diagnostics go to stderr
//! via tracing, since stdout carries the protocol.

use crate::error::Result;
use crate::manager::SessionManager;
use crate::tools::Toolbox;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Protocol revision reported by `initialize`.
const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

/// Incoming JSON-RPC request. A missing `id` marks a notification.
#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    #[serde(default)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    params: Option<Value>,
}

/// Outgoing JSON-RPC response.
#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

impl RpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Serve the tool protocol over stdin/stdout until EOF or shutdown signal.
pub async fn run(manager: Arc<SessionManager>, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
    let toolbox = Toolbox::new(manager);
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    info!("serving tool protocol on stdio");
    tokio::pin!(shutdown);
    loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("stdin closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = handle_line(&toolbox, &line).await {
            let mut payload = serde_json::to_string(&response)
                .unwrap_or_else(|e| {
                    serde_json::to_string(&RpcResponse::error(
                        Value::Null,
                        PARSE_ERROR,
                        format!("unserialisable response: {e}"),
                    ))
                    .expect("static error response serialises")
                });
            payload.push('\n');
            stdout.write_all(payload.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

/// Handle one request line. Returns `None` for notifications.
async fn handle_line(toolbox: &Toolbox, line: &str) -> Option<RpcResponse> {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "unparseable request");
            return Some(RpcResponse::error(
                Value::Null,
                PARSE_ERROR,
                format!("parse error: {e}"),
            ));
        }
    };

    let id = match request.id {
        Some(id) => id,
        // Notifications get no response.
        None => return None,
    };

    match request.method.as_str() {
        "initialize" => Some(RpcResponse::result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )),
        "ping" => Some(RpcResponse::result(id, json!({}))),
        "tools/list" => Some(RpcResponse::result(
            id,
            json!({ "tools": toolbox.definitions() }),
        )),
        "tools/call" => {
            let params = request.params.unwrap_or(Value::Null);
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Some(RpcResponse::error(
                    id,
                    INVALID_PARAMS,
                    "tools/call requires a 'name' parameter",
                ));
            };
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            Some(RpcResponse::result(id, call_tool(toolbox, name, &arguments).await))
        }
        other => Some(RpcResponse::error(
            id,
            METHOD_NOT_FOUND,
            format!("unknown method: {other}"),
        )),
    }
}

/// Run a tool and fold the outcome into MCP content. Errors become
/// `isError` content rather than protocol failures: the session fault is
/// data for the caller, not a broken connection.
async fn call_tool(toolbox: &Toolbox, name: &str, arguments: &Value) -> Value {
    match toolbox.call(name, arguments).await {
        Ok(result) => {
            let text = serde_json::to_string_pretty(&result.output)
                .unwrap_or_else(|_| result.output.to_string());
            json!({
                "content": [{ "type": "text", "text": text }],
                "isError": !result.success,
            })
        }
        Err(e) => {
            debug!(tool = %name, error = %e, "tool call failed");
            json!({
                "content": [{ "type": "text", "text": format!("Error: {e}") }],
                "isError": true,
            })
        }
    }
}
