//! Message types for agent-model communication.
//!
//! Follows the chat-completion conventions: a flat list of role-tagged
//! messages, with tool calls attached to assistant messages and tool
//! results delivered as `Tool`-role messages keyed by call id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool result message.
    Tool,
}

impl Role {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for the tool call.
    pub id: String,
    /// Name of the tool.
    pub name: String,
    /// Arguments as a JSON value.
    pub arguments: Value,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Parse the arguments into a typed value.
    ///
    /// Accepts both object arguments and JSON-encoded string arguments, as
    /// providers differ on which they emit.
    pub fn parse_arguments<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        match &self.arguments {
            Value::String(s) => serde_json::from_str(s),
            other => serde_json::from_value(other.clone()),
        }
    }
}

/// A chat message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender.
    pub role: Role,

    /// Text content, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Tool calls made by the model (assistant messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Tool call id this message responds to (tool messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a new system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a new user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a new assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create an assistant message carrying tool calls, with optional
    /// accompanying text.
    #[must_use]
    pub fn assistant_with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Create a tool result message for the given call id.
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Get the text content of the message.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        self.content.clone()
    }

    /// Check if this message has tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Returns `true` if this message carries tool traffic: a tool result,
    /// or an assistant message whose only payload is tool calls.
    #[must_use]
    pub fn is_tool_traffic(&self) -> bool {
        match self.role {
            Role::Tool => true,
            Role::Assistant => self.has_tool_calls() && self.content.is_none(),
            _ => false,
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::assistant("")
    }
}

/// User input to a run: a single utterance or pre-formed messages.
#[derive(Debug, Clone)]
pub enum UserInput {
    /// A single user utterance.
    Text(String),
    /// A sequence of pre-formed messages.
    Messages(Vec<Message>),
}

impl UserInput {
    /// Convert the input into conversation messages.
    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Text(text) => vec![Message::user(text)],
            Self::Messages(messages) => messages,
        }
    }
}

impl From<&str> for UserInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for UserInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<Message>> for UserInput {
    fn from(messages: Vec<Message>) -> Self {
        Self::Messages(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
        assert_eq!(Message::tool("id", "r").role, Role::Tool);
    }

    #[test]
    fn tool_message_carries_call_id() {
        let msg = Message::tool("call_1", "done");
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.text().as_deref(), Some("done"));
    }

    #[test]
    fn tool_traffic_detection() {
        let call = ToolCall::new("c1", "lookup", serde_json::json!({}));
        assert!(Message::assistant_with_tool_calls(None, vec![call.clone()]).is_tool_traffic());
        assert!(Message::tool("c1", "r").is_tool_traffic());
        // Assistant text alongside tool calls is kept by tool-traffic filters.
        assert!(!Message::assistant_with_tool_calls(Some("note".into()), vec![call]).is_tool_traffic());
        assert!(!Message::user("hi").is_tool_traffic());
    }

    #[test]
    fn parse_arguments_accepts_string_and_object() {
        #[derive(Deserialize)]
        struct Args {
            city: String,
        }

        let from_obj = ToolCall::new("1", "t", serde_json::json!({"city": "Tokyo"}));
        assert_eq!(from_obj.parse_arguments::<Args>().unwrap().city, "Tokyo");

        let from_str = ToolCall::new("2", "t", Value::String(r#"{"city":"Osaka"}"#.into()));
        assert_eq!(from_str.parse_arguments::<Args>().unwrap().city, "Osaka");
    }

    #[test]
    fn user_input_conversions() {
        let from_text: UserInput = "hello".into();
        assert_eq!(from_text.into_messages(), vec![Message::user("hello")]);

        let msgs = vec![Message::user("a"), Message::user("b")];
        let from_msgs: UserInput = msgs.clone().into();
        assert_eq!(from_msgs.into_messages(), msgs);
    }
}
