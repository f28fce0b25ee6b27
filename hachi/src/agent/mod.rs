//! Agents and the execution engine that drives them.
//!
//! An [`Agent`] is a named configuration bundle: an instruction source, an
//! LLM capability, tools, transfer targets, guardrails, limits, and
//! optional lifecycle hooks. Agents are immutable once built and shared
//! across runs; all mutable run state lives inside the [`Runner`].
//!
//! # Example
//!
//! ```rust,ignore
//! let agent = Agent::builder("assistant")
//!     .instructions("You are a helpful assistant.")
//!     .provider(provider)
//!     .model("gpt-4o")
//!     .tool(my_tool)
//!     .build()?;
//!
//! let result = Runner::run(&agent, "What is 2 + 2?", RunConfig::new()).await?;
//! ```

mod as_tool;
mod binder;
mod context;
mod dispatcher;
mod events;
mod hook;
mod options;
mod race;
mod result;
mod runner;
mod transfer;

#[cfg(test)]
mod integration_test;

pub use as_tool::AgentTool;
pub use binder::{SummarizeConfig, Summarizer};
pub use context::RunContext;
pub use events::{EventStream, RunEvent, text_stream};
pub use hook::{NoopRunHooks, RunHooks};
pub use options::{
    ApprovalOverride, DEFAULT_MAX_TURNS, DEFAULT_OUTPUT_RETRIES, PresuppliedApproval, RunConfig,
};
pub use race::{RaceOutcome, race};
pub use result::{
    RunItem, RunMetadata, RunResult, StepInfo, ToolCallRecord, ToolResultPayload,
};
pub use runner::{Runner, run_text};
pub use transfer::{InputFilter, TRANSFER_TOOL_PREFIX, TransferTarget, transfer_tool_name};

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::chat::{ModelSettings, ResponseFormat, SharedChatProvider, generate_json_schema};
use crate::error::{Error, Result};
use crate::guardrail::{InputGuardrail, OutputGuardrail};
use crate::mcp::McpTool;
use crate::tool::{DynTool, ToolBox, ToolRegistration};

/// Default per-agent step budget.
pub const DEFAULT_MAX_STEPS: usize = 20;

/// Where an agent's system prompt comes from.
#[derive(Clone)]
pub enum InstructionSource {
    /// A literal prompt.
    Static(String),
    /// A function of the run context, resolved at every LLM invocation.
    Dynamic(Arc<dyn Fn(&RunContext) -> String + Send + Sync>),
}

impl InstructionSource {
    /// Resolve the system prompt for this context.
    #[must_use]
    pub fn resolve(&self, ctx: &RunContext) -> String {
        match self {
            Self::Static(text) => text.clone(),
            Self::Dynamic(f) => f(ctx),
        }
    }
}

impl fmt::Debug for InstructionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(text) => f.debug_tuple("Static").field(&text.len()).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// A structured-output contract for an agent's final message.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    name: String,
    schema: Value,
}

impl OutputSchema {
    /// Create a schema with an explicit JSON Schema value.
    #[must_use]
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    /// Derive the schema from a Rust type.
    #[must_use]
    pub fn from_type<T: schemars::JsonSchema>() -> Self {
        let (name, schema) = generate_json_schema::<T>();
        Self { name, schema }
    }

    /// The schema name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The response-format request derived from this schema.
    #[must_use]
    pub fn to_response_format(&self) -> ResponseFormat {
        ResponseFormat::json_schema(self.name.clone(), self.schema.clone())
    }

    /// Validate a candidate final message against the schema.
    ///
    /// Checks that the text parses as JSON, that an object is produced
    /// when the schema demands one, and that every `required` top-level
    /// field is present.
    pub fn validate(&self, text: &str) -> std::result::Result<Value, String> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| format!("output is not valid JSON: {e}"))?;

        if self.schema.get("type").and_then(Value::as_str) == Some("object")
            && !value.is_object()
        {
            return Err("output is not a JSON object".to_owned());
        }

        if let Some(required) = self.schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if value.get(field).is_none() {
                    return Err(format!("missing required field '{field}'"));
                }
            }
        }

        Ok(value)
    }
}

/// Predicate consulted after each tool round to finish the run early.
pub type ShouldFinish = Arc<dyn Fn(&RunContext, &[RunItem]) -> bool + Send + Sync>;

/// A named configuration bundle the [`Runner`] can drive.
#[derive(Clone)]
pub struct Agent {
    /// The agent's identity.
    pub name: String,
    pub(crate) instructions: InstructionSource,
    pub(crate) provider: Option<SharedChatProvider>,
    pub(crate) model: String,
    pub(crate) model_settings: ModelSettings,
    pub(crate) tools: ToolBox,
    pub(crate) transfers: Vec<TransferTarget>,
    pub(crate) input_guardrails: Vec<InputGuardrail>,
    pub(crate) output_guardrails: Vec<OutputGuardrail>,
    pub(crate) output_schema: Option<OutputSchema>,
    pub(crate) max_steps: usize,
    pub(crate) should_finish: Option<ShouldFinish>,
    pub(crate) transfer_description: Option<String>,
    pub(crate) hooks: Option<Arc<dyn RunHooks>>,
}

impl Agent {
    /// Start building an agent with the given name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    /// The agent's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured transfer targets, in declaration order.
    #[must_use]
    pub fn transfers(&self) -> &[TransferTarget] {
        &self.transfers
    }

    /// Resolve the system prompt for this context.
    #[must_use]
    pub fn resolve_instructions(&self, ctx: &RunContext) -> String {
        self.instructions.resolve(ctx)
    }

    pub(crate) fn resolved_model(&self) -> String {
        if self.model.is_empty() {
            self.provider
                .as_ref()
                .map(|p| p.default_model().to_owned())
                .unwrap_or_default()
        } else {
            self.model.clone()
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("tools", &self.tools.len())
            .field("transfers", &self.transfers.len())
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Agent`].
#[derive(Default)]
pub struct AgentBuilder {
    name: String,
    instructions: Option<InstructionSource>,
    provider: Option<SharedChatProvider>,
    model: String,
    model_settings: ModelSettings,
    tools: ToolBox,
    transfers: Vec<TransferTarget>,
    input_guardrails: Vec<InputGuardrail>,
    output_guardrails: Vec<OutputGuardrail>,
    output_schema: Option<OutputSchema>,
    max_steps: Option<usize>,
    should_finish: Option<ShouldFinish>,
    transfer_description: Option<String>,
    hooks: Option<Arc<dyn RunHooks>>,
}

impl AgentBuilder {
    /// Create a builder for an agent with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set a literal system prompt.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(InstructionSource::Static(instructions.into()));
        self
    }

    /// Derive the system prompt from the run context at each invocation.
    #[must_use]
    pub fn instructions_fn(
        mut self,
        f: impl Fn(&RunContext) -> String + Send + Sync + 'static,
    ) -> Self {
        self.instructions = Some(InstructionSource::Dynamic(Arc::new(f)));
        self
    }

    /// Set the LLM provider.
    #[must_use]
    pub fn provider(mut self, provider: SharedChatProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the model identifier (defaults to the provider's default model).
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set per-agent sampling settings.
    #[must_use]
    pub const fn model_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = settings;
        self
    }

    /// Add a tool with default policy.
    #[must_use]
    pub fn tool(mut self, tool: impl DynTool + 'static) -> Self {
        self.tools.add(tool);
        self
    }

    /// Add a tool with an explicit registration (approval, enablement,
    /// timeout, failure budget).
    #[must_use]
    pub fn tool_registration(mut self, registration: ToolRegistration) -> Self {
        self.tools.add_registration(registration);
        self
    }

    /// Attach MCP-provided tools.
    #[must_use]
    pub fn mcp_tools(mut self, tools: Vec<McpTool>) -> Self {
        for tool in tools {
            self.tools.add(tool);
        }
        self
    }

    /// Declare a transfer target.
    #[must_use]
    pub fn transfer(mut self, agent: Arc<Agent>) -> Self {
        self.transfers.push(TransferTarget::new(agent));
        self
    }

    /// Declare a transfer target with filter/description options.
    #[must_use]
    pub fn transfer_target(mut self, target: TransferTarget) -> Self {
        self.transfers.push(target);
        self
    }

    /// Add an input guardrail.
    #[must_use]
    pub fn input_guardrail(mut self, guardrail: InputGuardrail) -> Self {
        self.input_guardrails.push(guardrail);
        self
    }

    /// Add an output guardrail.
    #[must_use]
    pub fn output_guardrail(mut self, guardrail: OutputGuardrail) -> Self {
        self.output_guardrails.push(guardrail);
        self
    }

    /// Require the final output to satisfy a schema.
    #[must_use]
    pub fn output_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Set the per-agent step budget (default 20). Exhausting it forces a
    /// finish with the last assistant message.
    #[must_use]
    pub const fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Finish the run early when the predicate returns `true` after a tool
    /// round.
    #[must_use]
    pub fn should_finish(
        mut self,
        predicate: impl Fn(&RunContext, &[RunItem]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_finish = Some(Arc::new(predicate));
        self
    }

    /// Description used when this agent is synthesized as a transfer tool
    /// for a peer.
    #[must_use]
    pub fn transfer_description(mut self, description: impl Into<String>) -> Self {
        self.transfer_description = Some(description.into());
        self
    }

    /// Attach agent-level lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Build the agent.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the name is empty.
    pub fn build(self) -> Result<Agent> {
        if self.name.is_empty() {
            return Err(Error::configuration("agent name must not be empty"));
        }

        Ok(Agent {
            name: self.name,
            instructions: self
                .instructions
                .unwrap_or_else(|| InstructionSource::Static(String::new())),
            provider: self.provider,
            model: self.model,
            model_settings: self.model_settings,
            tools: self.tools,
            transfers: self.transfers,
            input_guardrails: self.input_guardrails,
            output_guardrails: self.output_guardrails,
            output_schema: self.output_schema,
            max_steps: self.max_steps.unwrap_or(DEFAULT_MAX_STEPS),
            should_finish: self.should_finish,
            transfer_description: self.transfer_description,
            hooks: self.hooks,
        })
    }
}

impl fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("name", &self.name)
            .field("has_provider", &self.provider.is_some())
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}
