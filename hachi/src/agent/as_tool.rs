//! Using an agent as a tool of another agent.
//!
//! Unlike a transfer — which hands the whole conversation to a peer — an
//! agent-as-tool runs the child on just the call input and returns its
//! final output to the parent, which stays in control.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::runner::Runner;
use super::{Agent, RunConfig};
use crate::chat::generate_json_schema;
use crate::error::ToolError;
use crate::tool::{DynTool, ToolDefinition, ToolOutput};

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct AgentToolArgs {
    /// The input to hand to the sub-agent.
    input: String,
}

/// A tool whose executor runs another agent to completion.
#[derive(Clone)]
pub struct AgentTool {
    agent: Arc<Agent>,
    name: String,
    description: String,
}

impl AgentTool {
    /// Expose `agent` as a tool named after it.
    #[must_use]
    pub fn new(agent: Arc<Agent>) -> Self {
        let name = agent.name.clone();
        let description = agent
            .transfer_description
            .clone()
            .unwrap_or_else(|| format!("Run the '{name}' agent on a task and return its answer."));
        Self {
            agent,
            name,
            description,
        }
    }

    /// Override the exposed tool name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the tool description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl Agent {
    /// Convert this agent into a tool for a parent agent.
    #[must_use]
    pub fn as_tool(self: &Arc<Self>) -> AgentTool {
        AgentTool::new(Arc::clone(self))
    }
}

#[async_trait]
impl DynTool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> ToolDefinition {
        let (_, schema) = generate_json_schema::<AgentToolArgs>();
        ToolDefinition::new(&self.name, &self.description, schema)
    }

    async fn call_json(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let args: AgentToolArgs = match &args {
            Value::String(s) => {
                serde_json::from_str(s).map_err(|e| ToolError::InvalidArguments(e.to_string()))?
            }
            _ => serde_json::from_value(args)
                .map_err(|e| ToolError::InvalidArguments(e.to_string()))?,
        };

        let result = Runner::run(&self.agent, args.input, RunConfig::new())
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(ToolOutput::Value(result.output))
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name)
            .field("agent", &self.agent.name)
            .finish_non_exhaustive()
    }
}
