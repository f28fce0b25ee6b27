//! Explicit trace-context plumbing over `tracing` spans.
//!
//! The runner builds a per-run span hierarchy: `agent.run` →
//! `agent.step` → `llm.generate` / `tool` / `guardrail` / `session` /
//! `agent.handoff`. A [`TraceContext`] carries the parent span by value so
//! that work spawned concurrently (tool executors, guardrails, background
//! tasks) still attributes its children to the right parent rather than
//! to whatever span happens to be current on the executing task.
//!
//! With tracing disabled, every child is a `Span::none()` clone — span
//! operations are no-ops and nothing is allocated.

use tracing::{Span, info_span};

use crate::error::GuardrailPhase;

/// A handle to the current position in the run's span hierarchy.
#[derive(Clone, Debug)]
pub struct TraceContext {
    span: Span,
}

impl TraceContext {
    /// Root context for a run.
    #[must_use]
    pub fn root(agent_name: &str, enabled: bool) -> Self {
        if !enabled {
            return Self::disabled();
        }
        Self {
            span: info_span!(
                "agent.run",
                agent.name = %agent_name,
                gen_ai.system = "hachi",
            ),
        }
    }

    /// A context whose spans are all no-ops.
    #[must_use]
    pub fn disabled() -> Self {
        Self { span: Span::none() }
    }

    /// Returns `true` if this context records nothing.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.span.is_none()
    }

    /// The wrapped span, for use with `Instrument`.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Child context for one step of the loop.
    #[must_use]
    pub fn step(&self, step: usize, turn: usize) -> Self {
        if self.is_disabled() {
            return Self::disabled();
        }
        Self {
            span: info_span!(parent: &self.span, "agent.step", step, turn),
        }
    }

    /// Child context for an LLM invocation.
    #[must_use]
    pub fn llm(&self, model: &str) -> Self {
        if self.is_disabled() {
            return Self::disabled();
        }
        Self {
            span: info_span!(parent: &self.span, "llm.generate", llm.model = %model),
        }
    }

    /// Child context for a tool execution.
    #[must_use]
    pub fn tool(&self, name: &str, id: &str) -> Self {
        if self.is_disabled() {
            return Self::disabled();
        }
        Self {
            span: info_span!(
                parent: &self.span,
                "tool",
                tool.name = %name,
                tool.id = %id,
            ),
        }
    }

    /// Child context for a guardrail check.
    #[must_use]
    pub fn guardrail(&self, phase: GuardrailPhase, name: &str) -> Self {
        if self.is_disabled() {
            return Self::disabled();
        }
        Self {
            span: info_span!(
                parent: &self.span,
                "guardrail",
                guardrail.phase = %phase,
                guardrail.name = %name,
            ),
        }
    }

    /// Child context for a session operation.
    #[must_use]
    pub fn session(&self, op: &str) -> Self {
        if self.is_disabled() {
            return Self::disabled();
        }
        Self {
            span: info_span!(parent: &self.span, "session", session.op = %op),
        }
    }

    /// Child context for an agent handoff.
    #[must_use]
    pub fn handoff(&self, from: &str, to: &str) -> Self {
        if self.is_disabled() {
            return Self::disabled();
        }
        Self {
            span: info_span!(
                parent: &self.span,
                "agent.handoff",
                handoff.from = %from,
                handoff.to = %to,
            ),
        }
    }
}
