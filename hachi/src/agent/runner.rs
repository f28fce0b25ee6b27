//! Runner — the agent execution engine.
//!
//! The [`Runner`] drives an [`Agent`] through the run state machine:
//!
//! 1. Resolve the system prompt and assemble the tool catalogue
//! 2. Run input guardrails on the agent's first step
//! 3. Invoke the LLM (one invocation = one **turn**)
//! 4. Classify the response: final output, tool calls, or a transfer
//! 5. Dispatch tool calls / resolve the transfer, integrate results
//! 6. Loop, finish, or fail
//!
//! A **step** is one `Generating → Integrating` traversal; the per-agent
//! step counter resets on transfer while the per-run turn counter does
//! not. All mutable per-run state lives in `RunState`, which both the
//! blocking ([`Runner::run`]) and streaming ([`Runner::run_streamed`])
//! entry points drive through the same methods — the streaming path only
//! adds event emission between them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt as _;
use futures::future::join_all;
use serde_json::Value;
use tracing::{Instrument as _, debug, info, warn};
use uuid::Uuid;

use super::binder::{SessionBinder, output_to_text};
use super::context::RunContext;
use super::dispatcher::{BackgroundTask, PreparedCall, ToolDispatcher};
use super::events::{EventStream, RunEvent};
use super::hook::{HookPair, NoopRunHooks, RunHooks};
use super::options::{DEFAULT_MAX_TURNS, DEFAULT_OUTPUT_RETRIES, RunConfig};
use super::result::{
    NextStep, RunItem, RunMetadata, RunResult, StepInfo, ToolCallRecord, ToolResultPayload,
};
use super::transfer::transfer_reason;
use super::{Agent, OutputSchema};
use crate::cancel::CancelToken;
use crate::chat::{ChatRequest, ChatResponse, SharedChatProvider, ToolChoice};
use crate::error::{Error, GuardrailPhase, RunError, RunPhase};
use crate::message::{Message, ToolCall, UserInput};
use crate::runtime::CoreRuntime;
use crate::stream::{StopReason, StreamAggregator, StreamChunk};
use crate::trace::TraceContext;
use crate::usage::Usage;

/// The agent currently driving the run.
enum CurrentAgent<'a> {
    Root(&'a Agent),
    Hopped(Arc<Agent>),
}

impl CurrentAgent<'_> {
    fn get(&self) -> &Agent {
        match self {
            CurrentAgent::Root(agent) => agent,
            CurrentAgent::Hopped(agent) => agent,
        }
    }
}

/// How a candidate final message was resolved.
enum FinalDisposition {
    /// The output is accepted; finish the run.
    Finished(Value),
    /// Schema validation failed; a corrective message was appended and the
    /// loop takes another turn.
    Retry,
}

/// Data a completed transfer hands back for event emission.
struct TransferOutcome {
    from: String,
    to: String,
    call_id: String,
    call_name: String,
    payload: ToolResultPayload,
}

/// Every piece of mutable state accumulated during one run.
struct RunState<'a> {
    current: CurrentAgent<'a>,
    fallback_provider: SharedChatProvider,
    context: RunContext,
    trace: TraceContext,
    step_trace: TraceContext,
    runtime: Arc<CoreRuntime>,
    cancel: CancelToken,
    /// The LLM view of the conversation (system prompt excluded; it is
    /// prepended per request from the current agent).
    messages: Vec<Message>,
    /// Canonical append-only log of everything this run generated.
    items: Vec<RunItem>,
    /// Messages of fully-integrated steps, in order (the session batch).
    committed: Vec<Message>,
    /// Messages of the step currently integrating; discarded on failure.
    staged: Vec<Message>,
    step_infos: Vec<StepInfo>,
    usage: Usage,
    last_usage: Usage,
    turn: usize,
    max_turns: usize,
    output_retries_left: usize,
    handoff_chain: Vec<String>,
    warnings: Vec<String>,
    background: Vec<BackgroundTask>,
    issued_tokens: Vec<Uuid>,
    failure_counts: HashMap<String, u32>,
    input_guardrails_pending: bool,
    run_guardrails_spent: bool,
}

impl<'a> RunState<'a> {
    async fn init(
        agent: &'a Agent,
        input: UserInput,
        config: &RunConfig,
    ) -> std::result::Result<RunState<'a>, RunError> {
        let fail_at_init = |kind: Error, phase: RunPhase| RunError {
            kind,
            phase,
            agent: agent.name.clone(),
            step: 0,
            turn: 0,
            item_id: None,
        };

        let fallback_provider = agent.provider.clone().ok_or_else(|| {
            fail_at_init(
                Error::configuration(format!(
                    "agent '{}' has no provider configured",
                    agent.name
                )),
                RunPhase::Generation,
            )
        })?;

        let runtime = config
            .runtime
            .clone()
            .unwrap_or_else(CoreRuntime::global);
        let cancel = config.cancel.clone().unwrap_or_default();
        let trace = TraceContext::root(&agent.name, !config.tracing_disabled);
        let context = RunContext::new(&agent.name).with_context(config.context.clone());

        let mut messages = Vec::new();
        if let Some(session) = &config.session {
            messages = SessionBinder::load(session, config.summarize.as_ref(), &trace)
                .await
                .map_err(|e| fail_at_init(e, RunPhase::Session))?;
        }

        let input_messages = input.into_messages();
        let mut items = Vec::with_capacity(input_messages.len());
        for message in &input_messages {
            items.push(RunItem::Message {
                message: message.clone(),
            });
        }
        let committed = input_messages.clone();
        messages.extend(input_messages);

        Ok(RunState {
            current: CurrentAgent::Root(agent),
            fallback_provider,
            context,
            trace,
            step_trace: TraceContext::disabled(),
            runtime,
            cancel,
            messages,
            items,
            committed,
            staged: Vec::new(),
            step_infos: Vec::new(),
            usage: Usage::zero(),
            last_usage: Usage::zero(),
            turn: 0,
            max_turns: config.max_turns.unwrap_or(DEFAULT_MAX_TURNS),
            output_retries_left: config.output_retries.unwrap_or(DEFAULT_OUTPUT_RETRIES),
            handoff_chain: vec![agent.name.clone()],
            warnings: Vec::new(),
            background: Vec::new(),
            issued_tokens: Vec::new(),
            failure_counts: HashMap::new(),
            input_guardrails_pending: true,
            run_guardrails_spent: false,
        })
    }

    fn agent(&self) -> &Agent {
        self.current.get()
    }

    fn provider(&self) -> SharedChatProvider {
        self.agent()
            .provider
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.fallback_provider))
    }

    fn fail(&self, kind: Error, phase: RunPhase) -> RunError {
        RunError {
            kind,
            phase,
            agent: self.agent().name.clone(),
            step: self.context.step(),
            turn: self.turn,
            item_id: None,
        }
    }

    fn turn_budget_spent(&self) -> bool {
        self.turn >= self.max_turns
    }

    fn max_turns_error(&self) -> RunError {
        self.fail(
            Error::MaxTurnsExceeded {
                max_turns: self.max_turns,
            },
            RunPhase::Generation,
        )
    }

    fn push_message(&mut self, message: Message) {
        self.items.push(RunItem::Message {
            message: message.clone(),
        });
        self.staged.push(message.clone());
        self.messages.push(message);
    }

    fn commit_step(&mut self) {
        self.committed.append(&mut self.staged);
    }

    fn push_step_info(&mut self, started: Instant, tool_calls: Vec<ToolCallRecord>) {
        self.step_infos.push(StepInfo {
            step: self.context.step(),
            turn: self.turn,
            agent: self.agent().name.clone(),
            usage: self.last_usage,
            duration: started.elapsed(),
            tool_calls,
        });
    }

    fn last_step_info(&self) -> Option<&StepInfo> {
        self.step_infos.last()
    }

    /// The output used when the step budget forces a finish: the last
    /// assistant text, or an empty string.
    fn forced_output(&self) -> Value {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::Assistant && m.content.is_some())
            .and_then(Message::text)
            .map_or_else(|| Value::String(String::new()), Value::String)
    }

    /// Run pending input guardrails for the current agent, concurrently.
    ///
    /// Returns the guardrail events; a tripwire fails the run before any
    /// LLM invocation by this agent.
    async fn run_input_guardrails(
        &mut self,
        config: &RunConfig,
    ) -> std::result::Result<Vec<RunEvent>, RunError> {
        if !self.input_guardrails_pending {
            return Ok(Vec::new());
        }
        self.input_guardrails_pending = false;

        let mut guardrails = self.agent().input_guardrails.clone();
        if !self.run_guardrails_spent {
            self.run_guardrails_spent = true;
            guardrails.extend(config.input_guardrails.iter().cloned());
        }
        if guardrails.is_empty() {
            return Ok(Vec::new());
        }

        let agent_name = self.agent().name.clone();
        let ctx = self.context.clone();
        let view = self.messages.clone();
        let futures: Vec<_> = guardrails
            .iter()
            .map(|g| {
                let span = self.trace.guardrail(GuardrailPhase::In, g.name()).span().clone();
                g.run(&ctx, &agent_name, &view).instrument(span)
            })
            .collect();
        let results = join_all(futures).await;

        let mut events = Vec::with_capacity(results.len());
        let mut tripped: Option<(String, Value)> = None;
        for result in results {
            let result = result.map_err(|e| self.fail(e, RunPhase::InputGuardrail))?;
            let passed = !result.is_triggered();
            self.items.push(RunItem::GuardrailCheck {
                name: result.guardrail_name.clone(),
                phase: GuardrailPhase::In,
                passed,
                message: result.output.output_info.as_str().map(ToString::to_string),
            });
            events.push(RunEvent::Guardrail {
                name: result.guardrail_name.clone(),
                phase: GuardrailPhase::In,
                passed,
            });
            if !passed && tripped.is_none() {
                tripped = Some((result.guardrail_name, result.output.output_info));
            }
        }

        if let Some((name, info)) = tripped {
            return Err(self.fail(
                Error::GuardrailTripwire {
                    guardrail: name,
                    phase: GuardrailPhase::In,
                    info,
                },
                RunPhase::InputGuardrail,
            ));
        }
        Ok(events)
    }

    /// Advance the counters and assemble the request for the next turn.
    fn begin_turn_request(&mut self) -> (ChatRequest, SharedChatProvider) {
        self.turn += 1;
        self.context.advance_turn();
        self.context.advance_step();
        self.step_trace = self.trace.step(self.context.step(), self.turn);

        let agent = self.agent();
        let system = agent.resolve_instructions(&self.context);
        let mut prompt = Vec::with_capacity(self.messages.len() + 1);
        if !system.is_empty() {
            prompt.push(Message::system(system));
        }
        prompt.extend(self.messages.iter().cloned());

        // Catalogue: enabled static + MCP tools, then synthesized transfer
        // tools, in declaration order.
        let mut definitions = agent.tools.definitions(&self.context);
        definitions.extend(agent.transfers.iter().map(super::TransferTarget::definition));

        let mut request = ChatRequest::with_messages(agent.resolved_model(), prompt)
            .settings(agent.model_settings);
        if !definitions.is_empty() {
            request = request
                .tools(definitions)
                .tool_choice(ToolChoice::Auto)
                .parallel_tool_calls(true);
        }
        if let Some(schema) = &agent.output_schema {
            request = request.response_format(schema.to_response_format());
        }

        (request, self.provider())
    }

    /// One blocking LLM invocation, raced against cancellation.
    async fn generate(
        &mut self,
        hooks: &HookPair<'_>,
    ) -> std::result::Result<ChatResponse, RunError> {
        let (request, provider) = self.begin_turn_request();
        hooks.llm_start(&self.context, &request.messages).await;

        let span = self.step_trace.llm(&request.model).span().clone();
        let call = provider.chat(&request).instrument(span);
        let response = tokio::select! {
            result = call => result.map_err(|e| self.fail(e, RunPhase::Generation))?,
            () = self.cancel.cancelled() => {
                return Err(self.fail(Error::Cancelled, RunPhase::Generation));
            }
        };

        self.note_response(&response, hooks).await;
        Ok(response)
    }

    /// Open a streaming LLM invocation, raced against cancellation.
    async fn open_stream(
        &mut self,
        hooks: &HookPair<'_>,
    ) -> std::result::Result<crate::chat::ChunkStream, RunError> {
        let (mut request, provider) = self.begin_turn_request();
        request.stream = true;
        hooks.llm_start(&self.context, &request.messages).await;

        let span = self.step_trace.llm(&request.model).span().clone();
        let call = provider.chat_stream(&request).instrument(span);
        tokio::select! {
            result = call => result.map_err(|e| self.fail(e, RunPhase::Generation)),
            () = self.cancel.cancelled() => {
                Err(self.fail(Error::Cancelled, RunPhase::Generation))
            }
        }
    }

    async fn note_response(&mut self, response: &ChatResponse, hooks: &HookPair<'_>) {
        hooks.llm_end(&self.context, response).await;
        let usage = response.usage.unwrap_or_default();
        self.last_usage = usage;
        self.usage += usage;
        self.context.add_usage(usage);
        debug!(
            agent = %self.agent().name,
            turn = self.turn,
            tool_calls = response.tool_calls().map_or(0, <[ToolCall]>::len),
            "LLM turn completed",
        );
    }

    /// Classify a model response. A transfer call wins over ordinary tool
    /// calls in the same response; ordinary calls win over accompanying
    /// text.
    fn classify(&self, response: &ChatResponse) -> NextStep {
        let calls: Vec<ToolCall> = response
            .tool_calls()
            .map(<[ToolCall]>::to_vec)
            .unwrap_or_default();

        if calls.is_empty() {
            return NextStep::FinalOutput {
                text: response.text().unwrap_or_default(),
            };
        }

        let transfers = &self.agent().transfers;
        let transfer_position = calls.iter().position(|call| {
            transfers
                .iter()
                .any(|target| target.tool_name() == call.name)
        });

        if let Some(position) = transfer_position {
            let call = calls[position].clone();
            let target = transfers
                .iter()
                .position(|t| t.tool_name() == call.name)
                .unwrap_or_default();
            let discarded: Vec<ToolCall> = calls
                .into_iter()
                .enumerate()
                .filter_map(|(i, c)| (i != position).then_some(c))
                .collect();
            return NextStep::Transfer {
                target,
                call,
                discarded,
            };
        }

        NextStep::ToolCalls { calls }
    }

    /// Stage the assistant message and resolve the batch's approval plan.
    fn prepare_calls(
        &mut self,
        response: &ChatResponse,
        calls: &[ToolCall],
        config: &RunConfig,
    ) -> std::result::Result<Vec<PreparedCall>, RunError> {
        self.push_message(response.message.clone());

        let broker = Arc::clone(self.runtime.approvals());
        let prepared = {
            let dispatcher = ToolDispatcher {
                agent: self.agent(),
                config,
                broker: &broker,
                trace: &self.step_trace,
            };
            dispatcher
                .prepare(calls)
                .map_err(|e| self.fail(e, RunPhase::Dispatch))?
        };

        self.issued_tokens.extend(
            prepared
                .iter()
                .filter_map(|p| p.approval_record().map(|r| r.token)),
        );
        Ok(prepared)
    }

    /// Execute a prepared batch, integrate the results in call order, and
    /// close the step.
    async fn execute_calls(
        &mut self,
        prepared: Vec<PreparedCall>,
        config: &RunConfig,
        hooks: &HookPair<'_>,
        started: Instant,
    ) -> std::result::Result<Vec<ToolCallRecord>, RunError> {
        let broker = Arc::clone(self.runtime.approvals());
        let outcome = {
            let dispatcher = ToolDispatcher {
                agent: self.agent(),
                config,
                broker: &broker,
                trace: &self.step_trace,
            };
            let dispatch = dispatcher.execute(prepared, &self.context, hooks);
            tokio::select! {
                outcome = dispatch => outcome,
                () = self.cancel.cancelled() => {
                    return Err(self.fail(Error::Cancelled, RunPhase::Dispatch));
                }
            }
        };

        // Integrate in the model's call order, regardless of completion
        // order.
        for record in &outcome.records {
            self.items.push(RunItem::ToolCall {
                id: record.id.clone(),
                name: record.name.clone(),
                arguments: record.arguments.clone(),
            });
            self.items.push(RunItem::ToolResult {
                id: record.id.clone(),
                name: record.name.clone(),
                output: record.output.clone(),
            });
            let message = Message::tool(&record.id, record.output.text_for_llm());
            self.staged.push(message.clone());
            self.messages.push(message);
        }
        self.background.extend(outcome.background);

        // Consecutive-failure budgets, per tool.
        let limits: HashMap<String, u32> = outcome
            .records
            .iter()
            .filter_map(|r| {
                self.agent()
                    .tools
                    .get(&r.name)
                    .and_then(|reg| reg.max_consecutive_failures)
                    .map(|max| (r.name.clone(), max))
            })
            .collect();
        for record in &outcome.records {
            if let ToolResultPayload::Error { message } = &record.output {
                let count = self.failure_counts.entry(record.name.clone()).or_insert(0);
                *count += 1;
                if let Some(max) = limits.get(&record.name) {
                    if *count >= *max {
                        let failures = *count;
                        let mut err = self.fail(
                            Error::ToolExecution {
                                tool_name: record.name.clone(),
                                failures,
                                message: message.clone(),
                            },
                            RunPhase::Dispatch,
                        );
                        err.item_id = Some(record.id.clone());
                        return Err(err);
                    }
                }
            } else {
                self.failure_counts.remove(&record.name);
            }
        }

        self.push_step_info(started, outcome.records.clone());
        self.commit_step();
        Ok(outcome.records)
    }

    /// Whether the agent's early-finish predicate fires on the current log.
    fn should_finish_now(&self) -> bool {
        self.agent()
            .should_finish
            .as_ref()
            .is_some_and(|f| f(&self.context, &self.items))
    }

    /// Resolve a transfer: log it, hand the (optionally filtered) view to
    /// the target, swap agents, and reset the per-agent step counter.
    async fn integrate_transfer(
        &mut self,
        response: &ChatResponse,
        target_index: usize,
        call: ToolCall,
        discarded: Vec<ToolCall>,
        hooks: &HookPair<'_>,
        started: Instant,
    ) -> std::result::Result<TransferOutcome, RunError> {
        let target = self
            .agent()
            .transfers
            .get(target_index)
            .cloned()
            .ok_or_else(|| {
                self.fail(
                    Error::TransferFailure {
                        from: self.agent().name.clone(),
                        to: call.name.clone(),
                        message: "transfer target not found".to_owned(),
                    },
                    RunPhase::Transfer,
                )
            })?;
        let from = self.agent().name.clone();
        let to = target.agent.name.clone();

        // The filter sees the history as it stood before this transfer
        // round; the canonical log keeps everything.
        let pre_transfer_view = self.messages.clone();

        self.push_message(response.message.clone());

        let reason = transfer_reason(&call.arguments);
        let payload = ToolResultPayload::Value {
            value: serde_json::json!({ "transferred_to": to }),
        };
        self.items.push(RunItem::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });
        self.items.push(RunItem::ToolResult {
            id: call.id.clone(),
            name: call.name.clone(),
            output: payload.clone(),
        });
        let result_message = Message::tool(&call.id, payload.text_for_llm());
        self.staged.push(result_message.clone());
        self.messages.push(result_message);

        let mut records = vec![ToolCallRecord {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            output: payload.clone(),
        }];

        // Other calls in the same response lose to the transfer.
        for dropped in discarded {
            warn!(
                tool = %dropped.name,
                to = %to,
                "Discarding tool call superseded by transfer",
            );
            self.warnings.push(format!(
                "tool call '{}' discarded: superseded by transfer to '{to}'",
                dropped.name
            ));
            let dropped_payload = ToolResultPayload::Error {
                message: "call discarded: superseded by agent transfer".to_owned(),
            };
            self.items.push(RunItem::ToolCall {
                id: dropped.id.clone(),
                name: dropped.name.clone(),
                arguments: dropped.arguments.clone(),
            });
            self.items.push(RunItem::ToolResult {
                id: dropped.id.clone(),
                name: dropped.name.clone(),
                output: dropped_payload.clone(),
            });
            let message = Message::tool(&dropped.id, dropped_payload.text_for_llm());
            self.staged.push(message.clone());
            self.messages.push(message);
            records.push(ToolCallRecord {
                id: dropped.id,
                name: dropped.name,
                arguments: dropped.arguments,
                output: dropped_payload,
            });
        }

        self.items.push(RunItem::TransferCall {
            from: from.clone(),
            to: to.clone(),
            reason,
        });
        self.items.push(RunItem::TransferResolved {
            from: from.clone(),
            to: to.clone(),
        });

        {
            let span = self.trace.handoff(&from, &to);
            let _entered = span.span().enter();
            info!(from = %from, to = %to, "Agent transfer");
        }
        hooks.transfer(&self.context, &from, &to).await;

        self.push_step_info(started, records);
        self.commit_step();

        if let Some(filter) = &target.filter {
            self.messages = filter.apply(pre_transfer_view);
        }

        self.handoff_chain.push(to.clone());
        self.context.activate_agent(&to);
        self.input_guardrails_pending = true;
        self.current = CurrentAgent::Hopped(Arc::clone(&target.agent));

        Ok(TransferOutcome {
            from,
            to,
            call_id: call.id,
            call_name: call.name,
            payload,
        })
    }

    /// Integrate a candidate final message, applying structured-output
    /// validation and its retry policy.
    fn integrate_final(
        &mut self,
        response: &ChatResponse,
        started: Instant,
    ) -> std::result::Result<FinalDisposition, RunError> {
        self.push_message(response.message.clone());
        let text = response.text().unwrap_or_default();

        let schema: Option<OutputSchema> = self.agent().output_schema.clone();
        let output = if let Some(schema) = schema {
            match schema.validate(&text) {
                Ok(value) => value,
                Err(message) => {
                    if self.output_retries_left > 0 {
                        self.output_retries_left -= 1;
                        warn!(error = %message, "Structured output invalid, retrying");
                        let corrective = Message::user(format!(
                            "The previous response did not match the required output \
                             schema: {message}. Respond again with JSON that matches \
                             the schema exactly."
                        ));
                        self.push_message(corrective);
                        self.push_step_info(started, Vec::new());
                        self.commit_step();
                        return Ok(FinalDisposition::Retry);
                    }
                    return Err(self.fail(
                        Error::StructuredOutputInvalid { message },
                        RunPhase::Generation,
                    ));
                }
            }
        } else {
            Value::String(text)
        };

        self.push_step_info(started, Vec::new());
        self.commit_step();
        Ok(FinalDisposition::Finished(output))
    }

    /// Finish the run: output guardrails, background join, result
    /// assembly. Session write-back happens in the caller so that failure
    /// paths share it.
    async fn finalize(
        &mut self,
        output: Value,
        finish_reason: StopReason,
        config: &RunConfig,
        hooks: &HookPair<'_>,
        run_output_guardrails: bool,
    ) -> std::result::Result<(RunResult, Vec<RunEvent>), RunError> {
        let mut events = Vec::new();

        if run_output_guardrails {
            let mut guardrails = self.agent().output_guardrails.clone();
            guardrails.extend(config.output_guardrails.iter().cloned());

            if !guardrails.is_empty() {
                let agent_name = self.agent().name.clone();
                let ctx = self.context.clone();
                let futures: Vec<_> = guardrails
                    .iter()
                    .map(|g| {
                        let span = self
                            .trace
                            .guardrail(GuardrailPhase::Out, g.name())
                            .span()
                            .clone();
                        g.run(&ctx, &agent_name, &output).instrument(span)
                    })
                    .collect();
                let results = join_all(futures).await;

                let mut tripped: Option<(String, Value)> = None;
                for result in results {
                    let result = result.map_err(|e| self.fail(e, RunPhase::OutputGuardrail))?;
                    let passed = !result.is_triggered();
                    self.items.push(RunItem::GuardrailCheck {
                        name: result.guardrail_name.clone(),
                        phase: GuardrailPhase::Out,
                        passed,
                        message: result.output.output_info.as_str().map(ToString::to_string),
                    });
                    events.push(RunEvent::Guardrail {
                        name: result.guardrail_name.clone(),
                        phase: GuardrailPhase::Out,
                        passed,
                    });
                    if !passed && tripped.is_none() {
                        tripped = Some((result.guardrail_name, result.output.output_info));
                    }
                }

                if let Some((name, info)) = tripped {
                    // Terminal: detach outstanding background work.
                    for task in self.background.drain(..) {
                        task.handle.detach();
                    }
                    return Err(self.fail(
                        Error::GuardrailTripwire {
                            guardrail: name,
                            phase: GuardrailPhase::Out,
                            info,
                        },
                        RunPhase::OutputGuardrail,
                    ));
                }
            }
        }

        // Join outstanding background handles; failures become warnings,
        // never retroactive changes to the output.
        let tasks = std::mem::take(&mut self.background);
        for task in tasks {
            match task.handle.join().await {
                Ok(value) => {
                    self.amend_background(&task.id, ToolResultPayload::Value { value });
                }
                Err(err) => {
                    self.warnings.push(format!(
                        "background tool '{}' failed: {err}",
                        task.name
                    ));
                    self.amend_background(
                        &task.id,
                        ToolResultPayload::Error {
                            message: err.to_string(),
                        },
                    );
                }
            }
        }

        let broker = self.runtime.approvals();
        let pending_approvals = self
            .issued_tokens
            .iter()
            .filter_map(|token| broker.record(*token))
            .filter(|record| !record.status.is_terminal())
            .collect();

        hooks.run_end(&self.context, &output).await;
        info!(
            agent = %self.agent().name,
            turns = self.turn,
            input_tokens = self.usage.input_tokens,
            output_tokens = self.usage.output_tokens,
            "Run completed",
        );

        let steps = std::mem::take(&mut self.step_infos);
        let result = RunResult {
            output,
            items: std::mem::take(&mut self.items),
            new_messages: self.committed.clone(),
            metadata: RunMetadata {
                usage: self.usage,
                turns: self.turn,
                steps: steps.len(),
                handoff_chain: self.handoff_chain.clone(),
                warnings: std::mem::take(&mut self.warnings),
                finish_reason,
            },
            steps,
            pending_approvals,
            final_agent: self.agent().name.clone(),
        };
        Ok((result, events))
    }

    /// Replace the in-progress result for `id` with its final payload, in
    /// the item log, the message views, and the step records.
    fn amend_background(&mut self, id: &str, payload: ToolResultPayload) {
        for item in &mut self.items {
            if let RunItem::ToolResult { id: item_id, output, .. } = item {
                if item_id.as_str() == id && *output == ToolResultPayload::InProgress {
                    *output = payload.clone();
                }
            }
        }
        let text = payload.text_for_llm();
        for message in self.committed.iter_mut().chain(self.messages.iter_mut()) {
            if message.tool_call_id.as_deref() == Some(id) {
                message.content = Some(text.clone());
            }
        }
        for info in &mut self.step_infos {
            for record in &mut info.tool_calls {
                if record.id == id && record.output == ToolResultPayload::InProgress {
                    record.output = payload.clone();
                }
            }
        }
    }
}

/// Stateless execution engine that drives an [`Agent`] through the run
/// state machine.
///
/// `Runner` owns no state — everything per-run lives in an internal
/// `RunState` — so concurrent runs of the same agent are safe.
#[derive(Debug, Clone, Copy)]
pub struct Runner;

impl Runner {
    /// Execute a run to completion.
    ///
    /// # Errors
    ///
    /// Returns a [`RunError`] carrying the failure kind, the phase, the
    /// current agent, and the step/turn counters. Terminal failures still
    /// persist messages up to the last fully-integrated step when a
    /// session is configured.
    pub async fn run(
        agent: &Agent,
        input: impl Into<UserInput>,
        config: RunConfig,
    ) -> std::result::Result<RunResult, RunError> {
        let input = input.into();
        let mut state = RunState::init(agent, input, &config).await?;

        let noop = NoopRunHooks;
        let run_hooks: &dyn RunHooks = config.hooks.as_deref().unwrap_or(&noop);
        {
            let agent_hooks = state.agent().hooks.clone();
            let hooks = HookPair::new(run_hooks, agent_hooks.as_deref());
            hooks.run_start(&state.context).await;
        }

        let outcome = Self::drive(&mut state, &config, run_hooks).await;
        Self::flush_session(&state, &config).await;

        match outcome {
            Ok(result) => Ok(result),
            Err(err) => {
                let agent_hooks = state.agent().hooks.clone();
                let hooks = HookPair::new(run_hooks, agent_hooks.as_deref());
                hooks.error(&state.context, &err).await;
                Err(err)
            }
        }
    }

    /// The blocking drive loop; shared semantics with the streaming path.
    async fn drive(
        state: &mut RunState<'_>,
        config: &RunConfig,
        run_hooks: &dyn RunHooks,
    ) -> std::result::Result<RunResult, RunError> {
        loop {
            if state.cancel.is_cancelled() {
                return Err(state.fail(Error::Cancelled, RunPhase::Generation));
            }

            let agent_hooks = state.agent().hooks.clone();
            let hooks = HookPair::new(run_hooks, agent_hooks.as_deref());

            if state.context.step() >= state.agent().max_steps {
                info!(agent = %state.agent().name, "Step budget exhausted, forcing finish");
                let output = state.forced_output();
                let (result, _) = state
                    .finalize(output, StopReason::Length, config, &hooks, false)
                    .await?;
                return Ok(result);
            }
            if state.turn_budget_spent() {
                return Err(state.max_turns_error());
            }

            state.run_input_guardrails(config).await?;

            let started = Instant::now();
            let response = state.generate(&hooks).await?;

            match state.classify(&response) {
                NextStep::FinalOutput { .. } => {
                    match state.integrate_final(&response, started)? {
                        FinalDisposition::Retry => {}
                        FinalDisposition::Finished(output) => {
                            let (result, _) = state
                                .finalize(output, StopReason::Stop, config, &hooks, true)
                                .await?;
                            return Ok(result);
                        }
                    }
                }
                NextStep::Transfer {
                    target,
                    call,
                    discarded,
                } => {
                    if state.turn_budget_spent() {
                        return Err(state.max_turns_error());
                    }
                    state
                        .integrate_transfer(&response, target, call, discarded, &hooks, started)
                        .await?;
                }
                NextStep::ToolCalls { calls } => {
                    if state.turn_budget_spent() {
                        return Err(state.max_turns_error());
                    }
                    let prepared = state.prepare_calls(&response, &calls, config)?;
                    state.execute_calls(prepared, config, &hooks, started).await?;

                    if state.should_finish_now() {
                        let output = state.forced_output();
                        let (result, _) = state
                            .finalize(output, StopReason::Stop, config, &hooks, true)
                            .await?;
                        return Ok(result);
                    }
                }
            }
        }
    }

    /// Execute a run as an ordered event stream.
    ///
    /// Events of step *N* precede all events of step *N + 1*. The stream
    /// ends with a `Finish` event, or with one `Err` item carrying the
    /// terminal [`RunError`]. Dropping the stream abandons the in-flight
    /// LLM call and detaches background work.
    pub fn run_streamed<'a>(
        agent: &'a Agent,
        input: impl Into<UserInput>,
        config: RunConfig,
    ) -> EventStream<'a> {
        let input = input.into();
        Box::pin(Self::run_streamed_inner(agent, input, config))
    }

    // The `tail_expr_drop_order` warning originates inside the `stream!`
    // macro expansion, where temporaries in the generated async block's
    // tail expression have a different drop order under Rust 2024. This is
    // harmless and is a known upstream issue in `async-stream`.
    #[allow(tail_expr_drop_order)]
    fn run_streamed_inner(
        agent: &Agent,
        input: UserInput,
        config: RunConfig,
    ) -> impl futures::Stream<Item = std::result::Result<RunEvent, RunError>> + Send + '_ {
        async_stream::stream! {
            let mut state = match RunState::init(agent, input, &config).await {
                Ok(state) => state,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let noop = NoopRunHooks;
            let run_hooks: &dyn RunHooks = config.hooks.as_deref().unwrap_or(&noop);
            {
                let agent_hooks = state.agent().hooks.clone();
                let hooks = HookPair::new(run_hooks, agent_hooks.as_deref());
                hooks.run_start(&state.context).await;
            }
            yield Ok(RunEvent::AgentUpdated {
                name: state.agent().name.clone(),
            });

            let result = loop {
                if state.cancel.is_cancelled() {
                    let err = state.fail(Error::Cancelled, RunPhase::Generation);
                    Self::close_failed(&mut state, &config, run_hooks, &err).await;
                    yield Err(err);
                    return;
                }

                let agent_hooks = state.agent().hooks.clone();
                let hooks = HookPair::new(run_hooks, agent_hooks.as_deref());

                if state.context.step() >= state.agent().max_steps {
                    let output = state.forced_output();
                    match state
                        .finalize(output, StopReason::Length, &config, &hooks, false)
                        .await
                    {
                        Ok((result, events)) => {
                            for event in events {
                                yield Ok(event);
                            }
                            break result;
                        }
                        Err(err) => {
                            Self::close_failed(&mut state, &config, run_hooks, &err).await;
                            yield Err(err);
                            return;
                        }
                    }
                }
                if state.turn_budget_spent() {
                    let err = state.max_turns_error();
                    Self::close_failed(&mut state, &config, run_hooks, &err).await;
                    yield Err(err);
                    return;
                }

                match state.run_input_guardrails(&config).await {
                    Ok(events) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Err(err) => {
                        Self::close_failed(&mut state, &config, run_hooks, &err).await;
                        yield Err(err);
                        return;
                    }
                }

                let started = Instant::now();
                let supports_streaming = state.provider().supports_streaming();
                let response = if supports_streaming {
                    let mut chunk_stream = match state.open_stream(&hooks).await {
                        Ok(stream) => stream,
                        Err(err) => {
                            Self::close_failed(&mut state, &config, run_hooks, &err).await;
                            yield Err(err);
                            return;
                        }
                    };

                    let mut aggregator = StreamAggregator::new();
                    let mut stream_failure = None;
                    loop {
                        let next = tokio::select! {
                            chunk = chunk_stream.next() => chunk,
                            () = state.cancel.cancelled() => {
                                stream_failure =
                                    Some(state.fail(Error::Cancelled, RunPhase::Generation));
                                None
                            }
                        };
                        let Some(chunk) = next else { break };
                        match chunk {
                            Ok(chunk) => {
                                aggregator.apply(&chunk);
                                yield Ok(RunEvent::RawModelDelta { chunk });
                            }
                            Err(err) => {
                                stream_failure =
                                    Some(state.fail(err, RunPhase::Generation));
                                break;
                            }
                        }
                    }
                    drop(chunk_stream);
                    if let Some(err) = stream_failure {
                        Self::close_failed(&mut state, &config, run_hooks, &err).await;
                        yield Err(err);
                        return;
                    }

                    let reasoning = aggregator.reasoning().to_owned();
                    if !reasoning.is_empty() {
                        state.items.push(RunItem::Reasoning { text: reasoning });
                    }
                    let response = aggregator.into_chat_response();
                    state.note_response(&response, &hooks).await;
                    response
                } else {
                    match state.generate(&hooks).await {
                        Ok(response) => {
                            // Degrade to one synthesized delta per turn.
                            if let Some(text) = response.text().filter(|t| !t.is_empty()) {
                                yield Ok(RunEvent::RawModelDelta {
                                    chunk: StreamChunk::text(text),
                                });
                            }
                            response
                        }
                        Err(err) => {
                            Self::close_failed(&mut state, &config, run_hooks, &err).await;
                            yield Err(err);
                            return;
                        }
                    }
                };

                match state.classify(&response) {
                    NextStep::FinalOutput { .. } => {
                        yield Ok(RunEvent::MessageOutput {
                            message: response.message.clone(),
                        });
                        match state.integrate_final(&response, started) {
                            Ok(FinalDisposition::Retry) => {}
                            Ok(FinalDisposition::Finished(output)) => {
                                if let Some(info) = state.last_step_info() {
                                    yield Ok(RunEvent::StepFinish {
                                        info: Box::new(info.clone()),
                                    });
                                }
                                match state
                                    .finalize(output, StopReason::Stop, &config, &hooks, true)
                                    .await
                                {
                                    Ok((result, events)) => {
                                        for event in events {
                                            yield Ok(event);
                                        }
                                        break result;
                                    }
                                    Err(err) => {
                                        Self::close_failed(&mut state, &config, run_hooks, &err)
                                            .await;
                                        yield Err(err);
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                Self::close_failed(&mut state, &config, run_hooks, &err).await;
                                yield Err(err);
                                return;
                            }
                        }
                    }

                    NextStep::Transfer {
                        target,
                        call,
                        discarded,
                    } => {
                        if state.turn_budget_spent() {
                            let err = state.max_turns_error();
                            Self::close_failed(&mut state, &config, run_hooks, &err).await;
                            yield Err(err);
                            return;
                        }
                        yield Ok(RunEvent::MessageOutput {
                            message: response.message.clone(),
                        });
                        yield Ok(RunEvent::ToolCall {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        });
                        match state
                            .integrate_transfer(&response, target, call, discarded, &hooks, started)
                            .await
                        {
                            Ok(outcome) => {
                                yield Ok(RunEvent::ToolResult {
                                    id: outcome.call_id,
                                    name: outcome.call_name,
                                    output: outcome.payload,
                                });
                                yield Ok(RunEvent::Transfer {
                                    from: outcome.from,
                                    to: outcome.to.clone(),
                                });
                                yield Ok(RunEvent::AgentUpdated { name: outcome.to });
                                if let Some(info) = state.last_step_info() {
                                    yield Ok(RunEvent::StepFinish {
                                        info: Box::new(info.clone()),
                                    });
                                }
                            }
                            Err(err) => {
                                Self::close_failed(&mut state, &config, run_hooks, &err).await;
                                yield Err(err);
                                return;
                            }
                        }
                    }

                    NextStep::ToolCalls { calls } => {
                        if state.turn_budget_spent() {
                            let err = state.max_turns_error();
                            Self::close_failed(&mut state, &config, run_hooks, &err).await;
                            yield Err(err);
                            return;
                        }
                        yield Ok(RunEvent::MessageOutput {
                            message: response.message.clone(),
                        });
                        for call in &calls {
                            yield Ok(RunEvent::ToolCall {
                                id: call.id.clone(),
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            });
                        }

                        let prepared = match state.prepare_calls(&response, &calls, &config) {
                            Ok(prepared) => prepared,
                            Err(err) => {
                                Self::close_failed(&mut state, &config, run_hooks, &err).await;
                                yield Err(err);
                                return;
                            }
                        };
                        for record in prepared.iter().filter_map(PreparedCall::approval_record) {
                            yield Ok(RunEvent::ApprovalRequired {
                                record: record.clone(),
                            });
                        }

                        match state.execute_calls(prepared, &config, &hooks, started).await {
                            Ok(records) => {
                                for record in records {
                                    yield Ok(RunEvent::ToolResult {
                                        id: record.id,
                                        name: record.name,
                                        output: record.output,
                                    });
                                }
                                if let Some(info) = state.last_step_info() {
                                    yield Ok(RunEvent::StepFinish {
                                        info: Box::new(info.clone()),
                                    });
                                }
                            }
                            Err(err) => {
                                Self::close_failed(&mut state, &config, run_hooks, &err).await;
                                yield Err(err);
                                return;
                            }
                        }

                        if state.should_finish_now() {
                            let output = state.forced_output();
                            match state
                                .finalize(output, StopReason::Stop, &config, &hooks, true)
                                .await
                            {
                                Ok((result, events)) => {
                                    for event in events {
                                        yield Ok(event);
                                    }
                                    break result;
                                }
                                Err(err) => {
                                    Self::close_failed(&mut state, &config, run_hooks, &err).await;
                                    yield Err(err);
                                    return;
                                }
                            }
                        }
                    }
                }
            };

            Self::flush_session(&state, &config).await;
            yield Ok(RunEvent::Finish {
                result: Box::new(result),
            });
        }
    }

    /// Persist committed messages; failures downgrade to a warning log so
    /// a finished run is not retroactively failed by its session backend.
    async fn flush_session(state: &RunState<'_>, config: &RunConfig) {
        if let Some(session) = &config.session {
            if let Err(err) =
                SessionBinder::write(session, &state.committed, &state.trace).await
            {
                warn!(error = %err, "Failed to persist run messages to session");
            }
        }
    }

    /// Shared terminal-failure path for the streaming driver: persist
    /// committed state and fire the error hooks.
    async fn close_failed(
        state: &mut RunState<'_>,
        config: &RunConfig,
        run_hooks: &dyn RunHooks,
        err: &RunError,
    ) {
        for task in state.background.drain(..) {
            task.handle.detach();
        }
        Self::flush_session(state, config).await;
        let agent_hooks = state.agent().hooks.clone();
        let hooks = HookPair::new(run_hooks, agent_hooks.as_deref());
        hooks.error(&state.context, err).await;
    }
}

/// Convenience wrapper producing the final output text of a run.
///
/// Equivalent to `Runner::run(..)` followed by
/// [`output_text`](RunResult::output_text).
pub async fn run_text(
    agent: &Agent,
    input: impl Into<UserInput>,
    config: RunConfig,
) -> std::result::Result<String, RunError> {
    let result = Runner::run(agent, input, config).await?;
    Ok(output_to_text(&result.output))
}
