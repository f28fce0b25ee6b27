//! Streaming response types for LLM operations.
//!
//! Providers that support streaming deliver [`StreamChunk`]s; the
//! [`StreamAggregator`] rebuilds a complete [`ChatResponse`](crate::chat::ChatResponse)
//! from them so the run loop can process streamed and blocking turns
//! through the same code path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chat::ChatResponse;
use crate::message::{Message, ToolCall};
use crate::usage::Usage;

/// A chunk of streaming response from an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StreamChunk {
    /// Text content chunk.
    Text(String),

    /// Reasoning content chunk (for reasoning-capable models).
    Reasoning(String),

    /// Start of a tool/function call.
    ToolUseStart {
        /// Index of this tool call in the response.
        index: usize,
        /// Unique identifier for this tool call.
        id: String,
        /// Name of the tool being called.
        name: String,
    },

    /// Partial arguments for an in-progress tool call.
    ToolUseDelta {
        /// Index of the tool call being updated.
        index: usize,
        /// Partial JSON arguments.
        partial_json: String,
    },

    /// Token usage information (usually the final chunk before done).
    Usage(Usage),

    /// Stream is complete.
    Done {
        /// Stop reason from the model.
        stop_reason: Option<StopReason>,
    },
}

impl StreamChunk {
    /// Creates a text chunk.
    #[inline]
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    /// Returns the text content if this is a text chunk.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns `true` if this is a done chunk.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Reason why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum StopReason {
    /// Natural stop (end of response).
    #[default]
    Stop,
    /// Maximum token limit reached, or a forced finish on step exhaustion.
    Length,
    /// Model decided to call tools.
    ToolCalls,
    /// Content was filtered by safety systems.
    ContentFilter,
}

impl StopReason {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
        }
    }

    /// Parse from a provider finish-reason string (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "length" | "max_tokens" => Self::Length,
            "tool_calls" | "tool_use" => Self::ToolCalls,
            "content_filter" => Self::ContentFilter,
            _ => Self::Stop,
        }
    }

    /// Returns `true` if the response was truncated due to length.
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        matches!(self, Self::Length)
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregator for rebuilding a complete response from stream chunks.
#[derive(Debug, Clone, Default)]
pub struct StreamAggregator {
    text: String,
    reasoning: String,
    tool_calls: BTreeMap<usize, ToolCallBuilder>,
    usage: Option<Usage>,
    stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAggregator {
    /// Creates a new aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a stream chunk to the aggregator.
    pub fn apply(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::Text(text) => self.text.push_str(text),
            StreamChunk::Reasoning(text) => self.reasoning.push_str(text),
            StreamChunk::ToolUseStart { index, id, name } => {
                self.tool_calls.insert(
                    *index,
                    ToolCallBuilder {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: String::new(),
                    },
                );
            }
            StreamChunk::ToolUseDelta {
                index,
                partial_json,
            } => {
                if let Some(tc) = self.tool_calls.get_mut(index) {
                    tc.arguments.push_str(partial_json);
                }
            }
            StreamChunk::Usage(usage) => self.usage = Some(*usage),
            StreamChunk::Done { stop_reason } => self.stop_reason = *stop_reason,
        }
    }

    /// Returns the reasoning text accumulated so far.
    #[must_use]
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Consume the aggregator and build a complete [`ChatResponse`].
    #[must_use]
    pub fn into_chat_response(self) -> ChatResponse {
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_values()
            .map(|builder| {
                let arguments = if builder.arguments.is_empty() {
                    serde_json::Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(&builder.arguments)
                        .unwrap_or(serde_json::Value::String(builder.arguments))
                };
                ToolCall::new(builder.id, builder.name, arguments)
            })
            .collect();

        let content = (!self.text.is_empty()).then_some(self.text);
        let message = if tool_calls.is_empty() {
            Message::assistant(content.unwrap_or_default())
        } else {
            Message::assistant_with_tool_calls(content, tool_calls)
        };

        let stop_reason = self.stop_reason.unwrap_or_else(|| {
            if message.has_tool_calls() {
                StopReason::ToolCalls
            } else {
                StopReason::Stop
            }
        });

        let mut response = ChatResponse::new(message).with_stop_reason(stop_reason);
        if let Some(usage) = self.usage {
            response = response.with_usage(usage);
        }
        response
    }
}
