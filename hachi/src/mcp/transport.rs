//! Transport configuration for MCP servers.

use std::collections::HashMap;
use std::path::PathBuf;

/// How to reach an MCP server.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// Streamable HTTP (JSON-RPC 2.0 over POST).
    Http {
        /// Server URL, e.g. `http://localhost:8080`.
        url: String,
    },

    /// Line-delimited JSON-RPC 2.0 over a child process's stdin/stdout.
    Stdio {
        /// The command to execute (e.g. "python", "node").
        command: String,
        /// Command arguments.
        args: Vec<String>,
        /// Working directory for the child process.
        cwd: Option<PathBuf>,
        /// Extra environment variables for the child process.
        env: Option<HashMap<String, String>>,
    },
}

impl TransportConfig {
    /// HTTP transport to the given URL.
    #[must_use]
    pub fn http(url: impl Into<String>) -> Self {
        Self::Http { url: url.into() }
    }

    /// Stdio transport spawning the given command.
    #[must_use]
    pub fn stdio(command: impl Into<String>, args: &[&str]) -> Self {
        Self::Stdio {
            command: command.into(),
            args: args.iter().map(ToString::to_string).collect(),
            cwd: None,
            env: None,
        }
    }

    /// Set the child process working directory (stdio only).
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        if let Self::Stdio { ref mut cwd, .. } = self {
            *cwd = Some(dir.into());
        }
        self
    }

    /// Set child process environment variables (stdio only).
    #[must_use]
    pub fn env(mut self, vars: HashMap<String, String>) -> Self {
        if let Self::Stdio { ref mut env, .. } = self {
            *env = Some(vars);
        }
        self
    }
}
