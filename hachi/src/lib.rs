#![cfg_attr(docsrs, feature(doc_cfg))]
//! Hachi is a deterministic execution core for LLM-driven agents.
//!
//! Given an [`Agent`](agent::Agent) — a bundle of instructions, tools,
//! transfer targets, guardrails and limits — the [`Runner`](agent::Runner)
//! drives a bounded multi-step loop: the model proposes text, tool calls,
//! or a transfer to a peer agent; the core dispatches tool batches in
//! parallel (gating the ones that need human approval), integrates the
//! results, and decides when to stop. The same state machine powers both
//! the blocking [`run`](agent::Runner::run) entry point and the
//! event-streaming [`run_streamed`](agent::Runner::run_streamed) one.
//!
//! External collaborators — the LLM itself, session storage, guardrail
//! validators, approval handlers, MCP tool servers, the tracing backend —
//! are consumed through traits and can be swapped freely.
//!
//! # Example
//!
//! ```rust,ignore
//! use hachi::prelude::*;
//!
//! let agent = Agent::builder("assistant")
//!     .instructions("You are a helpful assistant.")
//!     .provider(provider)
//!     .tool(weather_tool)
//!     .build()?;
//!
//! let result = Runner::run(&agent, "What's the weather in Osaka?", RunConfig::new()).await?;
//! println!("{}", result.output_text().unwrap_or_default());
//! ```

// Core modules
pub mod cancel;
pub mod chat;
pub mod error;
pub mod message;
pub mod stream;
pub mod usage;

// Agent and tools
pub mod agent;
pub mod guardrail;
pub mod tool;

// Collaborators
pub mod approval;
pub mod mcp;
pub mod providers;
pub mod runtime;
pub mod session;
pub mod trace;

pub mod prelude;

// Re-export the types nearly every caller touches.
pub use agent::{Agent, RunConfig, RunResult, Runner};
pub use error::{Error, Result, RunError, ToolError};
pub use message::{Message, Role, UserInput};
pub use usage::Usage;
