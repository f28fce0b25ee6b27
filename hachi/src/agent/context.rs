//! Per-run context shared with tools, guardrails, and hooks.

use serde_json::Value;

use crate::usage::Usage;

/// The per-run view handed to tools, guardrails, `enabled` predicates and
/// lifecycle hooks.
///
/// Carries the opaque user context, the current agent, and the run's
/// counters. The canonical item log and trace handle live inside the
/// runner; collaborators observe the run through this value. A tool that
/// mutates state inside the user context value does so at the user's own
/// risk — the core neither locks nor snapshots it.
#[derive(Debug, Clone)]
pub struct RunContext {
    context: Value,
    agent_name: String,
    step: usize,
    turn: usize,
    usage: Usage,
}

impl RunContext {
    /// Create a context for the given agent.
    #[must_use]
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            context: Value::Null,
            agent_name: agent_name.into(),
            step: 0,
            turn: 0,
            usage: Usage::zero(),
        }
    }

    /// Attach the user-supplied context value.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// The opaque user context value.
    #[must_use]
    pub const fn context(&self) -> &Value {
        &self.context
    }

    /// Name of the agent currently driving the run.
    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Steps executed by the current agent (resets on transfer).
    #[must_use]
    pub const fn step(&self) -> usize {
        self.step
    }

    /// LLM invocations across the whole run.
    #[must_use]
    pub const fn turn(&self) -> usize {
        self.turn
    }

    /// Token usage accumulated so far.
    #[must_use]
    pub const fn usage(&self) -> Usage {
        self.usage
    }

    pub(crate) fn advance_step(&mut self) {
        self.step += 1;
    }

    pub(crate) fn advance_turn(&mut self) {
        self.turn += 1;
    }

    pub(crate) fn activate_agent(&mut self, name: impl Into<String>) {
        self.agent_name = name.into();
        self.step = 0;
    }

    pub(crate) fn add_usage(&mut self, usage: Usage) {
        self.usage += usage;
    }
}
