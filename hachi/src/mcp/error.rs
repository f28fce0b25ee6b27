//! MCP error types.

use thiserror::Error;

/// Errors from MCP server connections and calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum McpError {
    /// Could not connect to an HTTP server.
    #[error("failed to connect to MCP server at {url}: {message}")]
    HttpConnectionFailed {
        /// The server URL.
        url: String,
        /// The underlying error message.
        message: String,
    },

    /// Could not spawn or handshake with a stdio server process.
    #[error("failed to start MCP server process '{command}': {message}")]
    ProcessSpawnFailed {
        /// The command that failed.
        command: String,
        /// The underlying error message.
        message: String,
    },

    /// The `tools/list` request failed.
    #[error("failed to list MCP tools: {0}")]
    ListToolsFailed(String),
}
