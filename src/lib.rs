//! ptyhub - interactive PTY sessions over a JSON-RPC tool protocol
//!
//! The crate lets an external agent drive command-line programs as if
//! typing at a terminal:
//! - `sanitize`: raw PTY bytes → clean text
//! - `buffer`: bounded scrollback per session
//! - `session`: child process + read pump + sentinel completion detection
//! - `manager`: registry, capacity, idle reaper, shutdown fan-out
//! - `tools`: named operations over JSON argument maps
//! - `server`: newline-delimited JSON-RPC 2.0 stdio loop

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod logger;
pub mod manager;
pub mod sanitize;
pub mod server;
pub mod session;
pub mod tools;

pub use buffer::ScrollbackBuffer;
pub use config::{ServerConfig, SessionConfig};
pub use error::{Error, Result};
pub use logger::SessionLogger;
pub use manager::{SessionDescriptor, SessionManager};
pub use session::{CommandOutput, PtySession, SessionStatus};
pub use tools::{Tool, ToolDefinition, ToolResult, Toolbox};
