//! Convenience re-exports for the common path.
//!
//! ```rust,ignore
//! use hachi::prelude::*;
//! ```

pub use crate::agent::{
    Agent, AgentBuilder, AgentTool, InputFilter, OutputSchema, RunConfig, RunContext, RunEvent,
    RunItem, RunResult, Runner, SummarizeConfig, ToolResultPayload, TransferTarget, race,
    run_text, text_stream,
};
pub use crate::approval::{
    ApprovalBroker, ApprovalDecision, ApprovalHandler, ApprovalRecord, ApprovalRequest,
    AutoApproveHandler,
};
pub use crate::cancel::CancelToken;
pub use crate::chat::{
    ChatProvider, ChatRequest, ChatResponse, ModelSettings, SharedChatProvider,
};
pub use crate::error::{Error, GuardrailPhase, Result, RunError, RunPhase, ToolError};
pub use crate::guardrail::{
    GuardrailOutput, InputGuardrail, InputGuardrailCheck, OutputGuardrail, OutputGuardrailCheck,
};
pub use crate::mcp::{McpClient, McpServerConfig, TransportConfig};
pub use crate::message::{Message, Role, ToolCall, UserInput};
pub use crate::providers::MockProvider;
pub use crate::runtime::CoreRuntime;
pub use crate::session::{InMemorySession, Session, SharedSession};
pub use crate::stream::{StopReason, StreamChunk};
pub use crate::tool::{
    BackgroundHandle, DynTool, FunctionTool, Tool, ToolBox, ToolDefinition, ToolOutput,
    ToolRegistration,
};
pub use crate::usage::Usage;
