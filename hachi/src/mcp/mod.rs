//! Model Context Protocol (MCP) integration.
//!
//! Connects to MCP servers over stdio (spawned child process) or
//! streamable HTTP, lists their tools, and exposes each one in an agent's
//! catalogue under `<server>_<tool>`. Remote JSON Schemas become regular
//! [`ToolDefinition`](crate::tool::ToolDefinition)s; failed calls surface
//! as tool failures, never as run failures.
//!
//! ```rust,ignore
//! use hachi::mcp::{McpClient, McpServerConfig, TransportConfig};
//!
//! let client = McpClient::connect(McpServerConfig::new(
//!     "files",
//!     TransportConfig::stdio("python", &["server.py"]),
//! ))
//! .await?;
//!
//! let agent = Agent::builder("assistant")
//!     .mcp_tools(client.agent_tools())
//!     .build()?;
//! ```

mod client;
mod error;
mod tool;
mod transport;

pub use client::{McpClient, McpServerConfig};
pub use error::McpError;
pub use tool::McpTool;
pub use transport::TransportConfig;

use std::time::Duration;

/// Default timeout for a single MCP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
