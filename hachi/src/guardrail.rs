//! Guardrails — safety checks for agent inputs and outputs.
//!
//! - **[`InputGuardrail`]** validates user input before the first LLM call
//!   of each agent's first step (off-topic detection, content filtering).
//! - **[`OutputGuardrail`]** validates the candidate final output after
//!   generation (PII detection, format checking, policy compliance).
//!
//! # Tripwire mechanism
//!
//! Each check returns a [`GuardrailOutput`] with a `tripwire_triggered`
//! flag. Any triggered tripwire halts the run immediately with a
//! [`GuardrailTripwire`](crate::error::Error::GuardrailTripwire) failure;
//! when an input tripwire fires, no LLM call is made for that agent.
//!
//! Guardrails within a phase are independent and run concurrently; a
//! guardrail is free to call an LLM itself without serialising its peers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::RunContext;
use crate::error::Result;
use crate::message::Message;

/// The output of a guardrail check.
#[derive(Debug, Clone)]
pub struct GuardrailOutput {
    /// Whether the tripwire was triggered. `true` halts the run.
    pub tripwire_triggered: bool,

    /// Structured information about the check (reasons, scores, matches).
    pub output_info: Value,
}

impl GuardrailOutput {
    /// Create a passing output.
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            tripwire_triggered: false,
            output_info: Value::Null,
        }
    }

    /// Create a passing output with diagnostic information.
    #[must_use]
    pub fn pass_with_info(info: impl Into<Value>) -> Self {
        Self {
            tripwire_triggered: false,
            output_info: info.into(),
        }
    }

    /// Create a triggered output. `info` describes why and is carried into
    /// the resulting error.
    #[must_use]
    pub fn tripwire(info: impl Into<Value>) -> Self {
        Self {
            tripwire_triggered: true,
            output_info: info.into(),
        }
    }

    /// Returns `true` if the tripwire was triggered.
    #[must_use]
    pub const fn is_triggered(&self) -> bool {
        self.tripwire_triggered
    }
}

/// Check logic for an input guardrail.
///
/// Receives the run context, the current agent's name, and the message
/// view about to be sent to the LLM (the latest user utterance is the last
/// user message).
#[async_trait]
pub trait InputGuardrailCheck: Send + Sync {
    /// Check the input messages.
    async fn check(
        &self,
        context: &RunContext,
        agent_name: &str,
        input: &[Message],
    ) -> Result<GuardrailOutput>;
}

/// An input guardrail configured on an agent or a run.
#[derive(Clone)]
pub struct InputGuardrail {
    name: String,
    check: Arc<dyn InputGuardrailCheck>,
}

impl InputGuardrail {
    /// Create a new input guardrail.
    #[must_use]
    pub fn new(name: impl Into<String>, check: impl InputGuardrailCheck + 'static) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Returns the name of this guardrail.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute this guardrail check.
    pub async fn run(
        &self,
        context: &RunContext,
        agent_name: &str,
        input: &[Message],
    ) -> Result<GuardrailResult> {
        let output = self.check.check(context, agent_name, input).await?;
        Ok(GuardrailResult {
            guardrail_name: self.name.clone(),
            output,
        })
    }
}

impl std::fmt::Debug for InputGuardrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputGuardrail")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Check logic for an output guardrail, run over the candidate final output.
#[async_trait]
pub trait OutputGuardrailCheck: Send + Sync {
    /// Check the agent's final output.
    async fn check(
        &self,
        context: &RunContext,
        agent_name: &str,
        output: &Value,
    ) -> Result<GuardrailOutput>;
}

/// An output guardrail configured on an agent or a run.
#[derive(Clone)]
pub struct OutputGuardrail {
    name: String,
    check: Arc<dyn OutputGuardrailCheck>,
}

impl OutputGuardrail {
    /// Create a new output guardrail.
    #[must_use]
    pub fn new(name: impl Into<String>, check: impl OutputGuardrailCheck + 'static) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Returns the name of this guardrail.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute this guardrail check.
    pub async fn run(
        &self,
        context: &RunContext,
        agent_name: &str,
        output: &Value,
    ) -> Result<GuardrailResult> {
        let guardrail_output = self.check.check(context, agent_name, output).await?;
        Ok(GuardrailResult {
            guardrail_name: self.name.clone(),
            output: guardrail_output,
        })
    }
}

impl std::fmt::Debug for OutputGuardrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputGuardrail")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The result of running a guardrail.
#[derive(Debug, Clone)]
pub struct GuardrailResult {
    /// Name of the guardrail that produced this result.
    pub guardrail_name: String,

    /// The check output.
    pub output: GuardrailOutput,
}

impl GuardrailResult {
    /// Returns `true` if the tripwire was triggered.
    #[must_use]
    pub const fn is_triggered(&self) -> bool {
        self.output.tripwire_triggered
    }
}
