//! Error types for the hachi execution core.
//!
//! Three layers:
//!
//! - [`ToolError`] — failures inside a single tool executor. These are
//!   localised: the dispatcher records them as failure results and the
//!   loop continues so the model can recover.
//! - [`Error`] — the run-level failure taxonomy (budget, policy,
//!   validation, cancellation, collaborator transport).
//! - [`RunError`] — an [`Error`] kind wrapped with the context a caller
//!   needs to act on it: the phase the run was in, the current agent, and
//!   the step/turn counters at the time of failure.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which guardrail phase a check belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailPhase {
    /// Validates user input before the first LLM call of an agent.
    In,
    /// Validates the candidate final output.
    Out,
}

impl fmt::Display for GuardrailPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::In => "in",
            Self::Out => "out",
        })
    }
}

/// The phase of the run state machine a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPhase {
    /// Running input guardrails.
    InputGuardrail,
    /// Running output guardrails.
    OutputGuardrail,
    /// Invoking the LLM.
    Generation,
    /// Dispatching tool calls.
    Dispatch,
    /// Resolving an agent transfer.
    Transfer,
    /// Reading from or writing to the session.
    Session,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InputGuardrail => "input-guardrail",
            Self::OutputGuardrail => "output-guardrail",
            Self::Generation => "generation",
            Self::Dispatch => "dispatch",
            Self::Transfer => "transfer",
            Self::Session => "session",
        })
    }
}

/// Failure inside a single tool executor.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// No tool with this name is registered on the current agent.
    #[error("tool '{0}' not found")]
    NotFound(String),

    /// The call arguments did not match the tool's input schema.
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// The executor returned an error.
    #[error("tool execution failed: {0}")]
    Execution(String),

    /// The executor exceeded its configured timeout.
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),

    /// An MCP server call failed (transport or server-side error).
    #[error("mcp call failed: {0}")]
    Mcp(String),
}

impl ToolError {
    /// Create an execution error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArguments(err.to_string())
    }
}

/// The run-level failure taxonomy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The run performed more LLM invocations than `max_turns` allows.
    #[error("run exceeded the turn budget of {max_turns}")]
    MaxTurnsExceeded {
        /// The configured per-run turn budget.
        max_turns: usize,
    },

    /// A guardrail triggered its tripwire and terminated the run.
    #[error("guardrail '{guardrail}' tripped ({phase}): {info}")]
    GuardrailTripwire {
        /// Name of the guardrail that tripped.
        guardrail: String,
        /// The phase it tripped in.
        phase: GuardrailPhase,
        /// Structured diagnostic payload from the check.
        info: Value,
    },

    /// A tool exceeded its consecutive-failure budget.
    #[error("tool '{tool_name}' failed {failures} consecutive times: {message}")]
    ToolExecution {
        /// The failing tool.
        tool_name: String,
        /// How many consecutive failures were observed.
        failures: u32,
        /// The last failure message.
        message: String,
    },

    /// An agent transfer could not be resolved.
    #[error("transfer from '{from}' to '{to}' failed: {message}")]
    TransferFailure {
        /// The agent that requested the transfer.
        from: String,
        /// The intended target.
        to: String,
        /// Why the transfer failed.
        message: String,
    },

    /// A gated tool was called but no approval handler is configured and no
    /// pre-supplied decision matched.
    #[error("tool '{tool_name}' requires approval but no handler is configured")]
    ApprovalRequired {
        /// The gated tool.
        tool_name: String,
    },

    /// The final output never satisfied the configured schema.
    #[error("structured output invalid: {message}")]
    StructuredOutputInvalid {
        /// The last validation error.
        message: String,
    },

    /// The run was cancelled via its [`CancelToken`](crate::cancel::CancelToken).
    #[error("run was cancelled")]
    Cancelled,

    /// The LLM provider failed (transport, auth, server error).
    #[error("model error: {message}")]
    Model {
        /// The underlying error message.
        message: String,
    },

    /// The session backend failed.
    #[error("session error: {message}")]
    Session {
        /// The underlying error message.
        message: String,
    },

    /// Invalid agent or run configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration issue.
        message: String,
    },
}

impl Error {
    /// Create a model/provider error.
    #[must_use]
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model {
            message: message.into(),
        }
    }

    /// Create a session error.
    #[must_use]
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// A terminal run failure with the context needed to act on it.
///
/// Produced by [`Runner::run`](crate::agent::Runner::run) and delivered as
/// the final `Err` item of a streamed run.
#[derive(Debug, Error)]
#[error("{kind} (agent '{agent}', phase {phase}, step {step}, turn {turn})")]
pub struct RunError {
    /// The failure kind.
    pub kind: Error,
    /// The state-machine phase the run was in.
    pub phase: RunPhase,
    /// The agent that was current when the run failed.
    pub agent: String,
    /// Per-agent step counter at the time of failure.
    pub step: usize,
    /// Per-run turn counter at the time of failure.
    pub turn: usize,
    /// The offending item id, where one exists (e.g. a tool call id).
    pub item_id: Option<String>,
}

impl RunError {
    /// Returns `true` if the run failed because it was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, Error::Cancelled)
    }

    /// Returns `true` if the run failed on the turn budget.
    #[must_use]
    pub const fn is_max_turns(&self) -> bool {
        matches!(self.kind, Error::MaxTurnsExceeded { .. })
    }

    /// Returns `true` if a guardrail tripwire terminated the run.
    #[must_use]
    pub const fn is_tripwire(&self) -> bool {
        matches!(self.kind, Error::GuardrailTripwire { .. })
    }
}
