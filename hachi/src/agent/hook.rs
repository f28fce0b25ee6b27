//! Lifecycle hooks for observing a run.
//!
//! Hooks can be attached at two scopes: on the [`RunConfig`](super::RunConfig)
//! (per run) and on an [`Agent`](super::Agent) (fires whenever that agent
//! is current). [`HookPair`] merges the two so the runner dispatches each
//! event once.

use async_trait::async_trait;
use serde_json::Value;

use super::context::RunContext;
use super::result::ToolCallRecord;
use crate::chat::ChatResponse;
use crate::error::RunError;
use crate::message::Message;

/// Callbacks fired at run lifecycle points. All default to no-ops.
#[async_trait]
pub trait RunHooks: Send + Sync {
    /// The run started.
    async fn on_run_start(&self, ctx: &RunContext) {
        let _ = ctx;
    }

    /// An LLM invocation is about to happen.
    async fn on_llm_start(&self, ctx: &RunContext, messages: &[Message]) {
        let _ = (ctx, messages);
    }

    /// An LLM invocation completed.
    async fn on_llm_end(&self, ctx: &RunContext, response: &ChatResponse) {
        let _ = (ctx, response);
    }

    /// A tool is about to execute.
    async fn on_tool_start(&self, ctx: &RunContext, tool_name: &str) {
        let _ = (ctx, tool_name);
    }

    /// A tool finished (successfully or not).
    async fn on_tool_end(&self, ctx: &RunContext, record: &ToolCallRecord) {
        let _ = (ctx, record);
    }

    /// The run transferred between agents.
    async fn on_transfer(&self, ctx: &RunContext, from: &str, to: &str) {
        let _ = (ctx, from, to);
    }

    /// The run produced its final output.
    async fn on_run_end(&self, ctx: &RunContext, output: &Value) {
        let _ = (ctx, output);
    }

    /// The run failed terminally.
    async fn on_error(&self, ctx: &RunContext, error: &RunError) {
        let _ = (ctx, error);
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunHooks;

#[async_trait]
impl RunHooks for NoopRunHooks {}

/// Run-level and agent-level hooks merged into one dispatch target.
pub(crate) struct HookPair<'a> {
    run: &'a dyn RunHooks,
    agent: Option<&'a dyn RunHooks>,
}

impl<'a> HookPair<'a> {
    pub(crate) fn new(run: &'a dyn RunHooks, agent: Option<&'a dyn RunHooks>) -> Self {
        Self { run, agent }
    }

    pub(crate) async fn run_start(&self, ctx: &RunContext) {
        self.run.on_run_start(ctx).await;
        if let Some(agent) = self.agent {
            agent.on_run_start(ctx).await;
        }
    }

    pub(crate) async fn llm_start(&self, ctx: &RunContext, messages: &[Message]) {
        self.run.on_llm_start(ctx, messages).await;
        if let Some(agent) = self.agent {
            agent.on_llm_start(ctx, messages).await;
        }
    }

    pub(crate) async fn llm_end(&self, ctx: &RunContext, response: &ChatResponse) {
        self.run.on_llm_end(ctx, response).await;
        if let Some(agent) = self.agent {
            agent.on_llm_end(ctx, response).await;
        }
    }

    pub(crate) async fn tool_start(&self, ctx: &RunContext, tool_name: &str) {
        self.run.on_tool_start(ctx, tool_name).await;
        if let Some(agent) = self.agent {
            agent.on_tool_start(ctx, tool_name).await;
        }
    }

    pub(crate) async fn tool_end(&self, ctx: &RunContext, record: &ToolCallRecord) {
        self.run.on_tool_end(ctx, record).await;
        if let Some(agent) = self.agent {
            agent.on_tool_end(ctx, record).await;
        }
    }

    pub(crate) async fn transfer(&self, ctx: &RunContext, from: &str, to: &str) {
        self.run.on_transfer(ctx, from, to).await;
        if let Some(agent) = self.agent {
            agent.on_transfer(ctx, from, to).await;
        }
    }

    pub(crate) async fn run_end(&self, ctx: &RunContext, output: &Value) {
        self.run.on_run_end(ctx, output).await;
        if let Some(agent) = self.agent {
            agent.on_run_end(ctx, output).await;
        }
    }

    pub(crate) async fn error(&self, ctx: &RunContext, error: &RunError) {
        self.run.on_error(ctx, error).await;
        if let Some(agent) = self.agent {
            agent.on_error(ctx, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl RunHooks for Counting {
        async fn on_run_start(&self, _ctx: &RunContext) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn pair_dispatches_to_both_scopes() {
        let run_hooks = Counting::default();
        let agent_hooks = Counting::default();
        let pair = HookPair::new(&run_hooks, Some(&agent_hooks));

        let ctx = RunContext::new("a");
        pair.run_start(&ctx).await;

        assert_eq!(run_hooks.starts.load(Ordering::SeqCst), 1);
        assert_eq!(agent_hooks.starts.load(Ordering::SeqCst), 1);
    }
}
