//! Streamed run events.
//!
//! [`Runner::run_streamed`](super::Runner::run_streamed) exposes the run
//! state machine as an ordered event sequence. Events of step *N* strictly
//! precede events of step *N + 1*; the terminal error event is the
//! stream's final `Err` item.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde_json::Value;

use super::result::{RunResult, StepInfo, ToolResultPayload};
use crate::approval::ApprovalRecord;
use crate::error::{GuardrailPhase, RunError};
use crate::message::Message;
use crate::stream::StreamChunk;

/// An event emitted by a streamed run.
#[derive(Debug)]
#[non_exhaustive]
pub enum RunEvent {
    /// A raw fragment from the LLM (token or tool-call delta).
    RawModelDelta {
        /// The fragment.
        chunk: StreamChunk,
    },

    /// A complete assistant message was integrated into history.
    MessageOutput {
        /// The message.
        message: Message,
    },

    /// The model requested a tool call.
    ToolCall {
        /// Call id.
        id: String,
        /// Tool name.
        name: String,
        /// Call arguments.
        arguments: Value,
    },

    /// A tool call produced its result.
    ToolResult {
        /// Call id.
        id: String,
        /// Tool name.
        name: String,
        /// The outcome.
        output: ToolResultPayload,
    },

    /// The run transferred to a peer agent.
    Transfer {
        /// The requesting agent.
        from: String,
        /// The now-current agent.
        to: String,
    },

    /// A gated call is waiting for an approval decision.
    ///
    /// Emitted before the decision is awaited, so a consumer can approve
    /// out of band through the broker using the record's token.
    ApprovalRequired {
        /// The pending record.
        record: ApprovalRecord,
    },

    /// A step completed.
    StepFinish {
        /// The step summary.
        info: Box<StepInfo>,
    },

    /// A guardrail check completed.
    Guardrail {
        /// Guardrail name.
        name: String,
        /// Input or output phase.
        phase: GuardrailPhase,
        /// Whether the check passed.
        passed: bool,
    },

    /// The current agent changed (run start and after each transfer).
    AgentUpdated {
        /// The now-current agent.
        name: String,
    },

    /// The run completed.
    Finish {
        /// The final result.
        result: Box<RunResult>,
    },
}

/// A pinned, boxed stream of run events.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<RunEvent, RunError>> + Send + 'a>>;

/// Derive a text-only stream from an event stream: the concatenation of
/// the model's text deltas. Errors and non-text events are dropped.
pub fn text_stream<'a>(
    events: impl Stream<Item = Result<RunEvent, RunError>> + Send + 'a,
) -> impl Stream<Item = String> + Send + 'a {
    events.filter_map(|event| async move {
        match event {
            Ok(RunEvent::RawModelDelta {
                chunk: StreamChunk::Text(text),
            }) => Some(text),
            _ => None,
        }
    })
}
