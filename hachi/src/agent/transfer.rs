//! Transfer targets and the synthesized transfer tools.
//!
//! For each peer in an agent's transfer list the runner synthesizes a tool
//! named `transfer_to_<target>`. Its execution semantics are reserved: no
//! user code runs; the runner swaps the current agent, resets the
//! per-agent step counter, and keeps the per-run turn counter.
//!
//! A target may carry an [`InputFilter`] that rewrites the message *view*
//! handed to the new agent. The canonical item log keeps everything.

use std::sync::Arc;

use serde_json::Value;

use super::Agent;
use crate::message::Message;
use crate::tool::ToolDefinition;

/// Prefix of every synthesized transfer tool.
pub const TRANSFER_TOOL_PREFIX: &str = "transfer_to_";

/// The deterministic tool name for a transfer target: lowercased, with
/// every non-alphanumeric mapped to `_`.
#[must_use]
pub fn transfer_tool_name(agent_name: &str) -> String {
    let slug: String = agent_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{TRANSFER_TOOL_PREFIX}{slug}")
}

/// Rewrites the history view handed to a transfer target.
#[derive(Clone)]
pub enum InputFilter {
    /// Drop all tool traffic: tool results and tool-call-only assistant
    /// messages. Assistant text that accompanied tool calls survives.
    RemoveToolTraffic,
    /// Keep only the last `n` messages.
    KeepLastMessages(usize),
    /// Drop transfer tool calls and their synthetic results, keeping the
    /// rest of the conversation.
    StripTransferArtifacts,
    /// An arbitrary rewrite.
    Custom(Arc<dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync>),
}

impl InputFilter {
    /// Apply the filter to a history view.
    #[must_use]
    pub fn apply(&self, messages: Vec<Message>) -> Vec<Message> {
        match self {
            Self::RemoveToolTraffic => messages
                .into_iter()
                .filter_map(|mut message| {
                    if message.is_tool_traffic() {
                        return None;
                    }
                    // Keep accompanying text, drop the calls themselves.
                    if message.has_tool_calls() {
                        message.tool_calls = None;
                    }
                    Some(message)
                })
                .collect(),

            Self::KeepLastMessages(n) => {
                let skip = messages.len().saturating_sub(*n);
                messages.into_iter().skip(skip).collect()
            }

            Self::StripTransferArtifacts => {
                let transfer_ids: Vec<String> = messages
                    .iter()
                    .flat_map(|m| m.tool_calls.iter().flatten())
                    .filter(|c| c.name.starts_with(TRANSFER_TOOL_PREFIX))
                    .map(|c| c.id.clone())
                    .collect();

                messages
                    .into_iter()
                    .filter_map(|mut message| {
                        if message
                            .tool_call_id
                            .as_ref()
                            .is_some_and(|id| transfer_ids.contains(id))
                        {
                            return None;
                        }
                        if let Some(calls) = message.tool_calls.take() {
                            let kept: Vec<_> = calls
                                .into_iter()
                                .filter(|c| !c.name.starts_with(TRANSFER_TOOL_PREFIX))
                                .collect();
                            if !kept.is_empty() {
                                message.tool_calls = Some(kept);
                            } else if message.content.is_none() {
                                return None;
                            }
                        }
                        Some(message)
                    })
                    .collect()
            }

            Self::Custom(f) => f(messages),
        }
    }
}

impl std::fmt::Debug for InputFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RemoveToolTraffic => f.write_str("RemoveToolTraffic"),
            Self::KeepLastMessages(n) => f.debug_tuple("KeepLastMessages").field(n).finish(),
            Self::StripTransferArtifacts => f.write_str("StripTransferArtifacts"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A peer agent reachable by transfer.
///
/// Targets are held by value (`Arc<Agent>`), so an unresolved handoff is
/// unrepresentable. Cycles are not forbidden; the run's turn budget
/// bounds them.
#[derive(Clone, Debug)]
pub struct TransferTarget {
    pub(crate) agent: Arc<Agent>,
    pub(crate) description: Option<String>,
    pub(crate) filter: Option<InputFilter>,
}

impl TransferTarget {
    /// Declare `agent` as a transfer target.
    #[must_use]
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            description: None,
            filter: None,
        }
    }

    /// Override the description shown to the model for the synthesized
    /// tool. Defaults to the target agent's own transfer description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach an input filter applied to the view handed to the target.
    #[must_use]
    pub fn filter(mut self, filter: InputFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// The synthesized tool name for this target.
    #[must_use]
    pub fn tool_name(&self) -> String {
        transfer_tool_name(&self.agent.name)
    }

    /// The synthesized tool definition for this target.
    #[must_use]
    pub fn definition(&self) -> ToolDefinition {
        let description = self
            .description
            .clone()
            .or_else(|| self.agent.transfer_description.clone())
            .unwrap_or_else(|| {
                format!("Transfer the conversation to the '{}' agent.", self.agent.name)
            });

        ToolDefinition::new(
            self.tool_name(),
            description,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Why the conversation is being transferred."
                    }
                }
            }),
        )
    }
}

/// The free-form reason carried by a transfer call, if the model gave one.
#[must_use]
pub(crate) fn transfer_reason(arguments: &Value) -> Option<String> {
    arguments
        .get("reason")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}
