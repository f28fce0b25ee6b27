//! MCP client for connecting to local and remote servers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    ServiceExt,
    model::{ClientCapabilities, Implementation, InitializeRequestParams, Tool},
    service::ServerSink,
    transport::{StreamableHttpClientTransport, child_process::TokioChildProcess},
};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::error::McpError;
use super::tool::McpTool;
use super::transport::TransportConfig;

/// Configuration for one MCP server attachment.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Server name; prefixes every exposed tool as `<server>_<tool>`.
    pub name: String,
    /// How to reach the server.
    pub transport: TransportConfig,
    /// Only expose these remote tool names, when set.
    pub allow_list: Option<HashSet<String>>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl McpServerConfig {
    /// Create a config with the default request timeout and no allow-list.
    #[must_use]
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            allow_list: None,
            request_timeout: super::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Restrict the exposed tools to the given remote names.
    #[must_use]
    pub fn allow_list(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allow_list = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Set the per-request timeout (default 30 s).
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A connected MCP server.
///
/// Holds the cached tool list and the sink used to execute calls. The
/// connection is restartable: [`reconnect`](Self::reconnect) re-runs the
/// handshake and refreshes the tool list in place.
pub struct McpClient {
    config: McpServerConfig,
    sink: ServerSink,
    tools: Vec<Tool>,
    // Background task keeping the service alive.
    _service_handle: Arc<JoinHandle<()>>,
}

impl McpClient {
    /// Connect to the configured server and list its tools.
    pub async fn connect(config: McpServerConfig) -> Result<Self, McpError> {
        let (sink, tools, handle) = Self::establish(&config).await?;
        info!(
            server = %config.name,
            tools = tools.len(),
            "Connected to MCP server",
        );
        Ok(Self {
            config,
            sink,
            tools,
            _service_handle: Arc::new(handle),
        })
    }

    /// Re-establish the connection and refresh the tool list.
    ///
    /// Tools previously handed out keep their old sink and will fail their
    /// calls; fetch fresh ones via [`agent_tools`](Self::agent_tools).
    pub async fn reconnect(&mut self) -> Result<(), McpError> {
        let (sink, tools, handle) = Self::establish(&self.config).await?;
        self.sink = sink;
        self.tools = tools;
        self._service_handle = Arc::new(handle);
        Ok(())
    }

    /// Server name from the config.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.config.name
    }

    /// The raw remote tool list.
    #[must_use]
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    /// The exposed tool names, after allow-list filtering and prefixing.
    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        self.agent_tools()
            .iter()
            .map(|t| t.exposed_name().to_owned())
            .collect()
    }

    /// Wrap the remote tools for use in an agent's catalogue.
    ///
    /// Each tool is exposed as `<server>_<tool>` with its JSON Schema
    /// converted to a [`ToolDefinition`](crate::tool::ToolDefinition).
    #[must_use]
    pub fn agent_tools(&self) -> Vec<McpTool> {
        self.tools
            .iter()
            .filter(|tool| {
                self.config
                    .allow_list
                    .as_ref()
                    .is_none_or(|allowed| allowed.contains(tool.name.as_ref()))
            })
            .map(|tool| {
                McpTool::new(
                    &self.config.name,
                    tool.clone(),
                    self.sink.clone(),
                    self.config.request_timeout,
                )
            })
            .collect()
    }

    async fn establish(
        config: &McpServerConfig,
    ) -> Result<(ServerSink, Vec<Tool>, JoinHandle<()>), McpError> {
        let client_info = InitializeRequestParams {
            meta: None,
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "hachi".to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                ..Default::default()
            },
        };

        match &config.transport {
            TransportConfig::Http { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.as_str());

                let service = client_info.serve(transport).await.map_err(|e| {
                    McpError::HttpConnectionFailed {
                        url: url.clone(),
                        message: e.to_string(),
                    }
                })?;

                let sink = service.peer().clone();
                let tools = service
                    .peer()
                    .list_tools(Default::default())
                    .await
                    .map_err(|e| McpError::ListToolsFailed(e.to_string()))?
                    .tools;

                debug!(server = %config.name, url = %url, "MCP HTTP handshake complete");

                // Keep the service running in the background.
                let handle = tokio::spawn(async move {
                    let _ = service.waiting().await;
                });

                Ok((sink, tools, handle))
            }

            TransportConfig::Stdio {
                command,
                args,
                cwd,
                env,
            } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);

                if let Some(dir) = cwd {
                    cmd.current_dir(dir);
                }
                if let Some(env_vars) = env {
                    for (key, value) in env_vars {
                        cmd.env(key, value);
                    }
                }

                let transport =
                    TokioChildProcess::new(cmd).map_err(|e| McpError::ProcessSpawnFailed {
                        command: command.clone(),
                        message: e.to_string(),
                    })?;

                let service = client_info.serve(transport).await.map_err(|e| {
                    McpError::ProcessSpawnFailed {
                        command: command.clone(),
                        message: e.to_string(),
                    }
                })?;

                let sink = service.peer().clone();
                let tools = service
                    .peer()
                    .list_tools(Default::default())
                    .await
                    .map_err(|e| McpError::ListToolsFailed(e.to_string()))?
                    .tools;

                debug!(server = %config.name, command = %command, "MCP stdio handshake complete");

                let handle = tokio::spawn(async move {
                    let _ = service.waiting().await;
                });

                Ok((sink, tools, handle))
            }
        }
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server", &self.config.name)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = McpServerConfig::new("files", TransportConfig::http("http://localhost:1"))
            .allow_list(["read", "write"])
            .request_timeout(Duration::from_secs(5));

        assert_eq!(config.name, "files");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        let allowed = config.allow_list.expect("allow list");
        assert!(allowed.contains("read"));
        assert!(!allowed.contains("delete"));
    }
}
