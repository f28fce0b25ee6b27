//! Agent-facing wrapper around a remote MCP tool.

use std::time::Duration;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParams, Tool},
    service::ServerSink,
};
use serde_json::Value;
use tracing::warn;

use crate::error::ToolError;
use crate::tool::{DynTool, ToolDefinition, ToolOutput};

/// A remote MCP tool exposed in an agent's catalogue.
///
/// The exposed name is `<server>_<tool>`; the remote name travels on the
/// wire. Transport and server-side errors become [`ToolError::Mcp`], so a
/// broken server degrades to failed tool calls, never a failed run.
pub struct McpTool {
    exposed_name: String,
    remote_name: String,
    description: String,
    parameters: Value,
    sink: ServerSink,
    timeout: Duration,
}

impl McpTool {
    /// Wrap a remote tool listed by `server`.
    #[must_use]
    pub fn new(server: &str, tool: Tool, sink: ServerSink, timeout: Duration) -> Self {
        let remote_name = tool.name.to_string();
        let description = tool
            .description
            .as_deref()
            .unwrap_or("MCP-provided tool")
            .to_owned();
        let parameters =
            serde_json::to_value(tool.input_schema.as_ref()).unwrap_or_else(|_| {
                serde_json::json!({"type": "object"})
            });

        Self {
            exposed_name: format!("{server}_{remote_name}"),
            remote_name,
            description,
            parameters,
            sink,
            timeout,
        }
    }

    /// The catalogue name (`<server>_<tool>`).
    #[must_use]
    pub fn exposed_name(&self) -> &str {
        &self.exposed_name
    }

    /// The tool name on the server.
    #[must_use]
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    fn arguments_object(args: Value) -> Result<Option<serde_json::Map<String, Value>>, ToolError> {
        match args {
            Value::Object(map) => Ok(Some(map)),
            Value::Null => Ok(None),
            Value::String(s) => match serde_json::from_str(&s) {
                Ok(Value::Object(map)) => Ok(Some(map)),
                _ => Err(ToolError::InvalidArguments(
                    "MCP tool arguments must be a JSON object".to_owned(),
                )),
            },
            _ => Err(ToolError::InvalidArguments(
                "MCP tool arguments must be a JSON object".to_owned(),
            )),
        }
    }

    fn content_to_value(content: &[rmcp::model::Content]) -> Value {
        let texts: Vec<&str> = content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.as_str()))
            .collect();

        match texts.as_slice() {
            [] => serde_json::to_value(content).unwrap_or(Value::Null),
            [single] => {
                serde_json::from_str(single).unwrap_or_else(|_| Value::String((*single).to_owned()))
            }
            many => Value::String(many.join("\n")),
        }
    }
}

#[async_trait]
impl DynTool for McpTool {
    fn name(&self) -> &str {
        &self.exposed_name
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(&self.exposed_name, &self.description, self.parameters.clone())
    }

    async fn call_json(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let arguments = Self::arguments_object(args)?;
        let request = CallToolRequestParams {
            meta: None,
            name: self.remote_name.clone().into(),
            arguments,
            task: None,
        };

        let result = tokio::time::timeout(self.timeout, self.sink.call_tool(request))
            .await
            .map_err(|_| ToolError::Timeout(self.timeout))?
            .map_err(|e| {
                warn!(tool = %self.exposed_name, error = %e, "MCP call failed");
                ToolError::Mcp(e.to_string())
            })?;

        let value = Self::content_to_value(&result.content);
        if result.is_error.unwrap_or(false) {
            return Err(ToolError::Mcp(
                value.as_str().map_or_else(|| value.to_string(), ToString::to_string),
            ));
        }
        Ok(ToolOutput::Value(value))
    }
}

impl std::fmt::Debug for McpTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpTool")
            .field("exposed_name", &self.exposed_name)
            .field("remote_name", &self.remote_name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
