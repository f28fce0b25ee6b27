//! Tool-call dispatch: parallel fan-out, approval gating, background
//! deferral, and error routing.
//!
//! One batch per model response. Every call in the batch executes
//! concurrently; a call that requires approval awaits its own decision
//! without serialising the others. Results are returned in the model's
//! call order regardless of completion order.

use futures::future::join_all;
use serde_json::Value;
use tracing::{Instrument as _, warn};

use super::Agent;
use super::context::RunContext;
use super::hook::HookPair;
use super::options::RunConfig;
use super::result::{ToolCallRecord, ToolResultPayload};
use crate::approval::{ApprovalBroker, ApprovalDecision, ApprovalRecord, ApprovalRequest, args_digest};
use crate::error::{Error, ToolError};
use crate::message::ToolCall;
use crate::tool::{BackgroundHandle, ToolOutput};
use crate::trace::TraceContext;

/// A background result the runner joins before completing.
pub(crate) struct BackgroundTask {
    pub id: String,
    pub name: String,
    pub handle: BackgroundHandle,
}

#[derive(Debug)]
enum Gate {
    /// No approval needed.
    Open,
    /// Decision supplied up front on the run options.
    Presupplied(ApprovalDecision),
    /// Allocated in the broker; the handler decides.
    Broker(ApprovalRecord),
}

/// A call with its approval gate resolved to a plan.
#[derive(Debug)]
pub(crate) struct PreparedCall {
    call: ToolCall,
    gate: Gate,
}

impl PreparedCall {
    /// The broker record for this call, when it waits on a decision.
    pub(crate) fn approval_record(&self) -> Option<&ApprovalRecord> {
        match &self.gate {
            Gate::Broker(record) => Some(record),
            _ => None,
        }
    }
}

pub(crate) struct DispatchOutcome {
    pub records: Vec<ToolCallRecord>,
    pub background: Vec<BackgroundTask>,
}

pub(crate) struct ToolDispatcher<'a> {
    pub agent: &'a Agent,
    pub config: &'a RunConfig,
    pub broker: &'a ApprovalBroker,
    pub trace: &'a TraceContext,
}

impl ToolDispatcher<'_> {
    /// Resolve the approval plan for each call in the batch.
    ///
    /// Gated calls without a pre-supplied decision get a broker record
    /// here, *before* any execution starts, so streaming consumers can
    /// observe and answer them out of band.
    pub(crate) fn prepare(&self, calls: &[ToolCall]) -> Result<Vec<PreparedCall>, Error> {
        calls
            .iter()
            .map(|call| {
                let gate = if self.requires_approval(call) {
                    let digest = args_digest(&call.arguments);
                    if let Some(decision) = self.config.presupplied(&call.name, &digest) {
                        Gate::Presupplied(decision.clone())
                    } else if self.config.approval_handler.is_some() {
                        Gate::Broker(
                            self.broker
                                .allocate(call.name.clone(), call.arguments.clone()),
                        )
                    } else {
                        return Err(Error::ApprovalRequired {
                            tool_name: call.name.clone(),
                        });
                    }
                } else {
                    Gate::Open
                };

                Ok(PreparedCall {
                    call: call.clone(),
                    gate,
                })
            })
            .collect()
    }

    /// Execute the batch concurrently, preserving call order in the output.
    pub(crate) async fn execute(
        &self,
        prepared: Vec<PreparedCall>,
        ctx: &RunContext,
        hooks: &HookPair<'_>,
    ) -> DispatchOutcome {
        let futures: Vec<_> = prepared
            .into_iter()
            .map(|p| self.execute_one(p, ctx, hooks))
            .collect();

        let mut records = Vec::with_capacity(futures.len());
        let mut background = Vec::new();
        for (record, task) in join_all(futures).await {
            records.push(record);
            if let Some(task) = task {
                background.push(task);
            }
        }

        DispatchOutcome { records, background }
    }

    fn requires_approval(&self, call: &ToolCall) -> bool {
        if let Some(predicate) = &self.config.approval_override {
            if predicate(&call.name, &call.arguments) {
                return true;
            }
        }
        self.agent
            .tools
            .get(&call.name)
            .is_some_and(|r| r.requires_approval)
    }

    async fn execute_one(
        &self,
        prepared: PreparedCall,
        ctx: &RunContext,
        hooks: &HookPair<'_>,
    ) -> (ToolCallRecord, Option<BackgroundTask>) {
        let PreparedCall { call, gate } = prepared;
        let span = self.trace.tool(&call.name, &call.id).span().clone();

        async move {
            hooks.tool_start(ctx, &call.name).await;

            let mut args = call.arguments.clone();
            let decision = match gate {
                Gate::Open => None,
                Gate::Presupplied(decision) => Some(decision),
                Gate::Broker(record) => {
                    let decision = if let Some(handler) = &self.config.approval_handler {
                        let request = ApprovalRequest {
                            token: record.token,
                            tool_name: call.name.clone(),
                            arguments: args.clone(),
                        };
                        handler.decide(&request).await
                    } else {
                        ApprovalDecision::reject("no approval handler configured")
                    };
                    self.broker.resolve(record.token, decision.approved);
                    Some(decision)
                }
            };

            if let Some(decision) = decision {
                if !decision.approved {
                    let reason = decision
                        .reason
                        .unwrap_or_else(|| "approval denied".to_owned());
                    let record = ToolCallRecord {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: args,
                        output: ToolResultPayload::Error {
                            message: format!(
                                "Tool '{}' execution rejected: {reason}",
                                call.name
                            ),
                        },
                    };
                    hooks.tool_end(ctx, &record).await;
                    return (record, None);
                }
                if let Some(modified) = decision.modified_args {
                    args = modified;
                }
            }

            let (output, task) = match self.invoke(&call.name, args.clone()).await {
                Ok(ToolOutput::Value(value)) => (ToolResultPayload::Value { value }, None),
                Ok(ToolOutput::Background(handle)) => (
                    ToolResultPayload::InProgress,
                    Some(BackgroundTask {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        handle,
                    }),
                ),
                Err(err) => {
                    warn!(tool = %call.name, error = %err, "Tool execution failed");
                    (
                        ToolResultPayload::Error {
                            message: err.to_string(),
                        },
                        None,
                    )
                }
            };

            let record = ToolCallRecord {
                id: call.id,
                name: call.name,
                arguments: args,
                output,
            };
            hooks.tool_end(ctx, &record).await;
            (record, task)
        }
        .instrument(span)
        .await
    }

    async fn invoke(&self, name: &str, args: Value) -> Result<ToolOutput, ToolError> {
        let Some(registration) = self.agent.tools.get(name) else {
            return Err(ToolError::NotFound(name.to_owned()));
        };

        let call = registration.tool.call_json(args);
        match registration.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ToolError::Timeout(limit))?,
            None => call.await,
        }
    }
}
