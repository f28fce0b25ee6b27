//! Tool traits and utilities for defining agent tools.
//!
//! Tools are how agents act on the world. Each registered tool carries a
//! [`ToolDefinition`] (name, description, JSON Schema parameters) that is
//! exposed to the model, and an executor that the dispatcher invokes when
//! the model calls it.
//!
//! An executor produces a [`ToolOutput`]: either a direct JSON value or a
//! [`BackgroundHandle`] — a deliberately deferred result that the run
//! joins before completing. Failures are [`ToolError`]s; the dispatcher
//! records them as failure results and feeds them back to the model.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::RunContext;
use crate::error::ToolError;

/// Definition of a tool for LLM function calling.
///
/// Serializes to the function-calling wire format:
/// `{"type": "function", "function": {"name", "description", "parameters"}}`.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct ToolDefinition {
    /// Name of the tool (snake_case).
    pub name: String,

    /// Description of what the tool does.
    pub description: String,

    /// JSON Schema for the tool's parameters.
    pub parameters: Value,

    /// Whether to use strict schema validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            strict: None,
        }
    }

    /// Returns the tool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Serialize for ToolDefinition {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let mut function = serde_json::Map::new();
        function.insert("name".to_owned(), Value::String(self.name.clone()));
        function.insert(
            "description".to_owned(),
            Value::String(self.description.clone()),
        );
        function.insert("parameters".to_owned(), self.parameters.clone());
        if let Some(strict) = self.strict {
            function.insert("strict".to_owned(), Value::Bool(strict));
        }

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &function)?;
        map.end()
    }
}

/// A handle to a tool result that resolves after the current step.
///
/// The dispatcher records an in-progress result for the call and the
/// runner joins the handle before the run completes. Dropping the handle
/// detaches the task: it keeps running, its result is discarded.
#[derive(Debug)]
pub struct BackgroundHandle {
    handle: tokio::task::JoinHandle<Result<Value, ToolError>>,
}

impl BackgroundHandle {
    /// Spawn a future as a background tool result.
    #[must_use]
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Await the final value.
    pub(crate) async fn join(self) -> Result<Value, ToolError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(ToolError::Execution(format!(
                "background task failed: {err}"
            ))),
        }
    }

    /// Detach the task, discarding its eventual result.
    pub(crate) fn detach(self) {
        drop(self.handle);
    }
}

/// The outcome of a tool executor.
#[derive(Debug)]
pub enum ToolOutput {
    /// A direct JSON-serialisable value.
    Value(Value),
    /// A deferred result, joined before the run completes.
    Background(BackgroundHandle),
}

impl ToolOutput {
    /// Wrap a serialisable value.
    pub fn value<T: Serialize>(value: T) -> Result<Self, ToolError> {
        serde_json::to_value(value)
            .map(Self::Value)
            .map_err(|e| ToolError::Execution(e.to_string()))
    }
}

/// The core trait for typed tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static name of the tool.
    const NAME: &'static str;

    /// Arguments type for the tool.
    type Args: for<'de> Deserialize<'de> + Send;

    /// Output type of the tool.
    type Output: Serialize + Send;

    /// Error type for tool execution.
    type Error: Into<ToolError> + Send;

    /// Get the name of the tool.
    fn name(&self) -> &'static str {
        Self::NAME
    }

    /// Get the description of the tool.
    fn description(&self) -> String;

    /// Get the JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error>;

    /// Get the tool definition for LLM function calling.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters_schema())
    }
}

/// Object-safe version of the tool interface for dynamic dispatch.
#[async_trait]
pub trait DynTool: Send + Sync {
    /// Get the name of the tool.
    fn name(&self) -> &str;

    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Call the tool with JSON arguments.
    async fn call_json(&self, args: Value) -> Result<ToolOutput, ToolError>;
}

#[async_trait]
impl<T: Tool + 'static> DynTool for T
where
    T::Output: 'static,
{
    fn name(&self) -> &str {
        Tool::name(self)
    }

    fn definition(&self) -> ToolDefinition {
        Tool::definition(self)
    }

    async fn call_json(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let typed_args: T::Args = match &args {
            Value::String(s) => {
                serde_json::from_str(s).map_err(|e| ToolError::InvalidArguments(e.to_string()))?
            }
            _ => serde_json::from_value(args)
                .map_err(|e| ToolError::InvalidArguments(e.to_string()))?,
        };

        let output = self.call(typed_args).await.map_err(Into::into)?;
        ToolOutput::value(output)
    }
}

/// A shared dynamic tool.
pub type SharedTool = Arc<dyn DynTool>;

type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send>>;
type ToolFn = dyn Fn(Value) -> ToolFuture + Send + Sync;

/// A closure-backed tool.
///
/// The quickest way to register a tool without a dedicated type, and the
/// workhorse of the test suites. The raw constructor gives the closure
/// full control over the [`ToolOutput`], which is how background results
/// are produced.
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
    func: Arc<ToolFn>,
}

impl FunctionTool {
    /// Create a tool from a closure returning a direct value.
    #[must_use]
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        func: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let func = Arc::new(func);
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            func: Arc::new(move |args| {
                let func = Arc::clone(&func);
                Box::pin(async move { func(args).await.map(ToolOutput::Value) })
            }),
        }
    }

    /// Create a tool from a closure returning a [`ToolOutput`] directly.
    #[must_use]
    pub fn raw<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        func: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        let func = Arc::new(func);
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            func: Arc::new(move |args| {
                let func = Arc::clone(&func);
                Box::pin(async move { func(args).await })
            }),
        }
    }
}

impl fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DynTool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(&self.name, &self.description, self.parameters.clone())
    }

    async fn call_json(&self, args: Value) -> Result<ToolOutput, ToolError> {
        (self.func)(args).await
    }
}

/// Whether a tool is exposed in the catalogue.
#[derive(Clone)]
pub enum Enabled {
    /// A fixed flag.
    Flag(bool),
    /// A predicate over the run context, evaluated at catalogue time.
    When(Arc<dyn Fn(&RunContext) -> bool + Send + Sync>),
}

impl Enabled {
    /// Evaluate the flag or predicate.
    #[must_use]
    pub fn is_enabled(&self, ctx: &RunContext) -> bool {
        match self {
            Self::Flag(enabled) => *enabled,
            Self::When(pred) => pred(ctx),
        }
    }
}

impl Default for Enabled {
    fn default() -> Self {
        Self::Flag(true)
    }
}

impl fmt::Debug for Enabled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(enabled) => f.debug_tuple("Flag").field(enabled).finish(),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

/// A registered tool with its dispatch policy.
#[derive(Clone)]
pub struct ToolRegistration {
    pub(crate) tool: SharedTool,
    pub(crate) requires_approval: bool,
    pub(crate) enabled: Enabled,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_consecutive_failures: Option<u32>,
}

impl ToolRegistration {
    /// Register a tool with default policy (auto-approved, always enabled,
    /// no timeout, unlimited consecutive failures).
    #[must_use]
    pub fn new(tool: impl DynTool + 'static) -> Self {
        Self::from_shared(Arc::new(tool))
    }

    /// Register an already-shared tool.
    #[must_use]
    pub fn from_shared(tool: SharedTool) -> Self {
        Self {
            tool,
            requires_approval: false,
            enabled: Enabled::default(),
            timeout: None,
            max_consecutive_failures: None,
        }
    }

    /// Gate this tool behind human approval.
    #[must_use]
    pub const fn requires_approval(mut self, required: bool) -> Self {
        self.requires_approval = required;
        self
    }

    /// Enable or disable the tool with a fixed flag.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Enabled::Flag(enabled);
        self
    }

    /// Enable the tool only when the predicate holds for the run context.
    #[must_use]
    pub fn enabled_when(
        mut self,
        predicate: impl Fn(&RunContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.enabled = Enabled::When(Arc::new(predicate));
        self
    }

    /// Set a per-call execution timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fail the run after this many consecutive failures of the tool.
    #[must_use]
    pub const fn max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = Some(max);
        self
    }

    /// The tool's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.tool.name()
    }
}

impl fmt::Debug for ToolRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistration")
            .field("name", &self.tool.name())
            .field("requires_approval", &self.requires_approval)
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// An ordered collection of tool registrations for an agent.
#[derive(Clone, Default)]
pub struct ToolBox {
    entries: Vec<ToolRegistration>,
}

impl ToolBox {
    /// Create a new empty toolbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool with default policy.
    pub fn add(&mut self, tool: impl DynTool + 'static) {
        self.entries.push(ToolRegistration::new(tool));
    }

    /// Add a registration.
    pub fn add_registration(&mut self, registration: ToolRegistration) {
        self.entries.push(registration);
    }

    /// Get a registration by tool name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolRegistration> {
        self.entries.iter().find(|e| e.tool.name() == name)
    }

    /// Check if the toolbox contains a tool with the given name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Definitions of all tools enabled for this context, in registration
    /// order. Disabled tools are filtered here — at catalogue time, never
    /// at dispatch time.
    #[must_use]
    pub fn definitions(&self, ctx: &RunContext) -> Vec<ToolDefinition> {
        self.entries
            .iter()
            .filter(|e| e.enabled.is_enabled(ctx))
            .map(|e| e.tool.definition())
            .collect()
    }

    /// Iterate over the registrations.
    pub fn iter(&self) -> impl Iterator<Item = &ToolRegistration> {
        self.entries.iter()
    }

    /// Get the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the toolbox is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ToolBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolBox")
            .field(
                "tools",
                &self.entries.iter().map(|e| e.tool.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
