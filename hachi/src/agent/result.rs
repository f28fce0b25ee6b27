//! Run results and the append-only item log.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::ApprovalRecord;
use crate::error::GuardrailPhase;
use crate::message::{Message, ToolCall};
use crate::stream::StopReason;
use crate::usage::Usage;

/// The payload of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolResultPayload {
    /// The executor returned a value.
    Value {
        /// The returned value.
        value: Value,
    },
    /// The executor failed or the call was rejected.
    Error {
        /// Human-readable failure or rejection message.
        message: String,
    },
    /// A background result that has not materialised yet.
    ///
    /// Amended in place to `Value` or `Error` before the run completes, so
    /// the final log carries exactly one result per call.
    InProgress,
}

impl ToolResultPayload {
    /// Returns `true` for a failure or rejection payload.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// The value, if materialised.
    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value { value } => Some(value),
            _ => None,
        }
    }

    /// Render the payload as the text fed back to the model.
    #[must_use]
    pub fn text_for_llm(&self) -> String {
        match self {
            Self::Value { value } => value
                .as_str()
                .map_or_else(|| value.to_string(), ToString::to_string),
            Self::Error { message } => format!("Error: {message}"),
            Self::InProgress => "(result pending, running in background)".to_owned(),
        }
    }
}

/// One executed (or rejected) tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// The call id from the model.
    pub id: String,
    /// The tool name.
    pub name: String,
    /// The arguments the call executed with.
    pub arguments: Value,
    /// The outcome.
    pub output: ToolResultPayload,
}

/// An entry in the run's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum RunItem {
    /// A conversation message generated by the run.
    Message {
        /// The message.
        message: Message,
    },
    /// A tool call requested by the model.
    ToolCall {
        /// Call id.
        id: String,
        /// Tool name.
        name: String,
        /// Call arguments.
        arguments: Value,
    },
    /// The result matching a tool call.
    ToolResult {
        /// Call id.
        id: String,
        /// Tool name.
        name: String,
        /// The outcome.
        output: ToolResultPayload,
    },
    /// The model requested a transfer to a peer agent.
    TransferCall {
        /// The requesting agent.
        from: String,
        /// The target agent.
        to: String,
        /// Free-form reason supplied by the model.
        reason: Option<String>,
    },
    /// A transfer completed and the target agent became current.
    TransferResolved {
        /// The requesting agent.
        from: String,
        /// The now-current agent.
        to: String,
    },
    /// A guardrail check that ran.
    GuardrailCheck {
        /// Guardrail name.
        name: String,
        /// Input or output phase.
        phase: GuardrailPhase,
        /// Whether the check passed.
        passed: bool,
        /// Diagnostic message, if the check produced one.
        message: Option<String>,
    },
    /// Reasoning text emitted by the model.
    Reasoning {
        /// The reasoning content.
        text: String,
    },
}

/// One LLM invocation and the work it caused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    /// Per-agent step number (1-based).
    pub step: usize,
    /// Per-run turn number (1-based).
    pub turn: usize,
    /// The agent that drove this step.
    pub agent: String,
    /// Token usage of this invocation.
    pub usage: Usage,
    /// Wall-clock duration of the step.
    pub duration: Duration,
    /// Tool calls dispatched in this step.
    pub tool_calls: Vec<ToolCallRecord>,
}

/// Aggregated facts about a completed run.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    /// Total token usage across all turns.
    pub usage: Usage,
    /// LLM invocations performed.
    pub turns: usize,
    /// Steps executed across all agents.
    pub steps: usize,
    /// Every agent that was current, in order.
    pub handoff_chain: Vec<String>,
    /// Non-fatal anomalies (discarded calls, failed background results).
    pub warnings: Vec<String>,
    /// Why the run finished.
    pub finish_reason: StopReason,
}

/// The outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// The final output: a string for plain text, or the parsed value when
    /// a structured output schema is configured.
    pub output: Value,
    /// The full history slice this run generated.
    pub items: Vec<RunItem>,
    /// The messages this run generated, in order (what the session binder
    /// appends).
    pub new_messages: Vec<Message>,
    /// One entry per LLM invocation.
    pub steps: Vec<StepInfo>,
    /// Aggregated metadata.
    pub metadata: RunMetadata,
    /// Approval requests issued by this run that never resolved.
    pub pending_approvals: Vec<ApprovalRecord>,
    /// The agent that produced the final output.
    pub final_agent: String,
}

impl RunResult {
    /// The final output as text, when it is a plain string.
    #[must_use]
    pub fn output_text(&self) -> Option<&str> {
        self.output.as_str()
    }

    /// Deserialize the final output into a concrete type.
    pub fn output_as<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.output.clone())
    }
}

/// Classification of one model response.
#[derive(Debug)]
pub(crate) enum NextStep {
    /// The model produced a final answer.
    FinalOutput {
        /// The raw text of the final message.
        text: String,
    },
    /// The model requested ordinary tool calls.
    ToolCalls {
        /// The calls, in response order.
        calls: Vec<ToolCall>,
    },
    /// The model requested a transfer (which wins over any other calls in
    /// the same response).
    Transfer {
        /// Index into the current agent's transfer list.
        target: usize,
        /// The transfer tool call itself.
        call: ToolCall,
        /// Ordinary calls from the same response, discarded with a warning.
        discarded: Vec<ToolCall>,
    },
}
