//! Run-level configuration.

use std::sync::Arc;

use serde_json::Value;

use super::binder::SummarizeConfig;
use super::hook::RunHooks;
use crate::approval::{ApprovalDecision, ApprovalHandler, args_digest};
use crate::cancel::CancelToken;
use crate::guardrail::{InputGuardrail, OutputGuardrail};
use crate::runtime::CoreRuntime;
use crate::session::SharedSession;

/// Default per-run budget of LLM invocations.
pub const DEFAULT_MAX_TURNS: usize = 10;

/// Default number of structured-output retries.
pub const DEFAULT_OUTPUT_RETRIES: usize = 1;

/// A pre-supplied approval decision, matched by tool name and argument
/// digest before any handler is consulted.
#[derive(Debug, Clone)]
pub struct PresuppliedApproval {
    pub(crate) tool_name: String,
    pub(crate) args_digest: String,
    pub(crate) decision: ApprovalDecision,
}

/// Dynamic override of which tool calls require approval.
pub type ApprovalOverride = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Configuration for a single run.
#[derive(Clone, Default)]
pub struct RunConfig {
    pub(crate) session: Option<SharedSession>,
    pub(crate) context: Value,
    pub(crate) max_turns: Option<usize>,
    pub(crate) approval_handler: Option<Arc<dyn ApprovalHandler>>,
    pub(crate) approvals: Vec<PresuppliedApproval>,
    pub(crate) approval_override: Option<ApprovalOverride>,
    pub(crate) runtime: Option<Arc<CoreRuntime>>,
    pub(crate) cancel: Option<CancelToken>,
    pub(crate) tracing_disabled: bool,
    pub(crate) hooks: Option<Arc<dyn RunHooks>>,
    pub(crate) input_guardrails: Vec<InputGuardrail>,
    pub(crate) output_guardrails: Vec<OutputGuardrail>,
    pub(crate) summarize: Option<SummarizeConfig>,
    pub(crate) output_retries: Option<usize>,
}

impl RunConfig {
    /// Create a default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session; its history prefixes the prompt and the run's
    /// messages are appended on completion.
    #[must_use]
    pub fn session(mut self, session: SharedSession) -> Self {
        self.session = Some(session);
        self
    }

    /// Attach an opaque user context value, visible to tools, guardrails
    /// and instruction functions.
    #[must_use]
    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Cap the number of LLM invocations for this run (default 10).
    #[must_use]
    pub const fn max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    /// Set the handler consulted for gated tool calls.
    #[must_use]
    pub fn approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval_handler = Some(handler);
        self
    }

    /// Pre-supply a decision for an exact `{tool, args}` pair.
    #[must_use]
    pub fn pre_approve(mut self, tool_name: impl Into<String>, args: &Value, decision: ApprovalDecision) -> Self {
        self.approvals.push(PresuppliedApproval {
            tool_name: tool_name.into(),
            args_digest: args_digest(args),
            decision,
        });
        self
    }

    /// Dynamically override which calls require approval. The predicate
    /// receives the tool name and arguments; returning `true` gates the
    /// call even if its registration does not.
    #[must_use]
    pub fn approval_override(
        mut self,
        predicate: impl Fn(&str, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.approval_override = Some(Arc::new(predicate));
        self
    }

    /// Use a specific runtime instead of the process-wide default.
    #[must_use]
    pub fn runtime(mut self, runtime: Arc<CoreRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Disable tracing for this run; all span operations become no-ops.
    #[must_use]
    pub const fn disable_tracing(mut self) -> Self {
        self.tracing_disabled = true;
        self
    }

    /// Attach lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Add a run-level input guardrail (in addition to the agent's own).
    #[must_use]
    pub fn input_guardrail(mut self, guardrail: InputGuardrail) -> Self {
        self.input_guardrails.push(guardrail);
        self
    }

    /// Add a run-level output guardrail (in addition to the agent's own).
    #[must_use]
    pub fn output_guardrail(mut self, guardrail: OutputGuardrail) -> Self {
        self.output_guardrails.push(guardrail);
        self
    }

    /// Enable session summarisation with the given policy.
    #[must_use]
    pub fn summarize(mut self, config: SummarizeConfig) -> Self {
        self.summarize = Some(config);
        self
    }

    /// Number of corrective retries when structured output fails to
    /// validate (default 1).
    #[must_use]
    pub const fn output_retries(mut self, retries: usize) -> Self {
        self.output_retries = Some(retries);
        self
    }

    pub(crate) fn presupplied(&self, tool_name: &str, digest: &str) -> Option<&ApprovalDecision> {
        self.approvals
            .iter()
            .find(|a| a.tool_name == tool_name && a.args_digest == digest)
            .map(|a| &a.decision)
    }
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("has_session", &self.session.is_some())
            .field("max_turns", &self.max_turns)
            .field("approvals", &self.approvals.len())
            .field("tracing_disabled", &self.tracing_disabled)
            .finish_non_exhaustive()
    }
}
