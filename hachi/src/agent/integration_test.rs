//! End-to-end tests for the run loop: budgets, parallel dispatch,
//! approvals, transfers, guardrails, background results, streaming, and
//! the invariants that hold across all of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt as _;
use serde_json::{Value, json};

use super::*;
use crate::approval::{AlwaysRejectHandler, ApprovalDecision, AutoApproveHandler};
use crate::cancel::CancelToken;
use crate::chat::{ChatResponse, SharedChatProvider};
use crate::error::{Error, GuardrailPhase};
use crate::guardrail::{
    GuardrailOutput, InputGuardrail, InputGuardrailCheck, OutputGuardrail, OutputGuardrailCheck,
};
use crate::message::{Message, Role, ToolCall};
use crate::providers::MockProvider;
use crate::runtime::CoreRuntime;
use crate::session::{InMemorySession, Session};
use crate::stream::StopReason;
use crate::tool::{BackgroundHandle, FunctionTool, ToolOutput, ToolRegistration};
use crate::usage::Usage;

fn text(content: &str) -> ChatResponse {
    ChatResponse::from_text(content).with_usage(Usage::new(10, 5))
}

fn calls(calls: Vec<ToolCall>) -> ChatResponse {
    ChatResponse::new(Message::assistant_with_tool_calls(None, calls))
        .with_stop_reason(StopReason::ToolCalls)
        .with_usage(Usage::new(10, 5))
}

fn isolated() -> RunConfig {
    RunConfig::new().runtime(Arc::new(CoreRuntime::new()))
}

fn echo_tool(name: &str) -> FunctionTool {
    FunctionTool::new(
        name.to_owned(),
        "Echo the arguments",
        json!({"type": "object"}),
        |args| async move { Ok(args) },
    )
}

fn counting_tool(name: &str, counter: Arc<AtomicUsize>) -> FunctionTool {
    FunctionTool::new(
        name.to_owned(),
        "Count invocations",
        json!({"type": "object"}),
        move |_args| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::String("continue".into()))
            }
        },
    )
}

fn sleepy_tool(name: &str, millis: u64) -> FunctionTool {
    FunctionTool::new(
        name.to_owned(),
        "Sleep then answer",
        json!({"type": "object"}),
        move |_args| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(Value::String(format!("slept {millis}ms")))
        },
    )
}

struct Blocklist(&'static str);

#[async_trait::async_trait]
impl InputGuardrailCheck for Blocklist {
    async fn check(
        &self,
        _ctx: &RunContext,
        _agent: &str,
        input: &[Message],
    ) -> crate::error::Result<GuardrailOutput> {
        let hit = input
            .iter()
            .filter_map(Message::text)
            .any(|t| t.contains(self.0));
        Ok(if hit {
            GuardrailOutput::tripwire(format!("input contains '{}'", self.0))
        } else {
            GuardrailOutput::pass()
        })
    }
}

struct RecordingOutputCheck(Arc<AtomicBool>);

#[async_trait::async_trait]
impl OutputGuardrailCheck for RecordingOutputCheck {
    async fn check(
        &self,
        _ctx: &RunContext,
        _agent: &str,
        _output: &Value,
    ) -> crate::error::Result<GuardrailOutput> {
        self.0.store(true, Ordering::SeqCst);
        Ok(GuardrailOutput::pass())
    }
}

mod plain_runs {
    use super::*;

    #[tokio::test]
    async fn single_message_run_echoes_model_text() {
        // No tools, no transfers: exactly one assistant message whose
        // content equals the model's text.
        let provider = Arc::new(MockProvider::new(vec![text("hello there")]));
        let agent = Agent::builder("plain")
            .instructions("Be brief.")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .build()
            .unwrap();

        let result = Runner::run(&agent, "hi", isolated()).await.unwrap();

        assert_eq!(result.output_text(), Some("hello there"));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(result.metadata.turns, 1);
        assert_eq!(result.metadata.finish_reason, StopReason::Stop);

        let assistant_messages: Vec<&Message> = result
            .new_messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .collect();
        assert_eq!(assistant_messages.len(), 1);
        assert_eq!(assistant_messages[0].text().as_deref(), Some("hello there"));
    }

    #[tokio::test]
    async fn system_prompt_is_prepended_each_turn() {
        let provider = Arc::new(MockProvider::new(vec![text("ok")]));
        let agent = Agent::builder("prompted")
            .instructions("You are terse.")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .build()
            .unwrap();

        Runner::run(&agent, "hi", isolated()).await.unwrap();

        let request = &provider.requests()[0];
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[0].text().as_deref(), Some("You are terse."));
        assert_eq!(request.messages[1].text().as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn per_step_usage_sums_to_metadata_total() {
        // The sum of per-step token counts equals the aggregate.
        let counter = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![ToolCall::new("c1", "count", json!({}))]),
            text("done"),
        ]));
        let agent = Agent::builder("summing")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(counting_tool("count", counter))
            .build()
            .unwrap();

        let result = Runner::run(&agent, "go", isolated()).await.unwrap();

        let summed: Usage = result.steps.iter().map(|s| s.usage).sum();
        assert_eq!(summed, result.metadata.usage);
        assert_eq!(result.metadata.usage, Usage::new(20, 10));
    }

    #[tokio::test]
    async fn dynamic_instructions_resolve_from_context() {
        let provider = Arc::new(MockProvider::new(vec![text("ok")]));
        let agent = Agent::builder("dyn")
            .instructions_fn(|ctx| format!("Address the user as {}.", ctx.context()["name"]))
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .build()
            .unwrap();

        Runner::run(
            &agent,
            "hi",
            isolated().context(json!({"name": "Mei"})),
        )
        .await
        .unwrap();

        let system = provider.requests()[0].messages[0].text().unwrap();
        assert!(system.contains("Mei"));
    }
}

mod budgets {
    use super::*;

    #[tokio::test]
    async fn turn_budget_is_a_hard_bound() {
        // A looping tool under max_turns = 3 makes exactly 3 LLM calls
        // and 2 tool executions.
        let executions = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(MockProvider::new(vec![calls(vec![ToolCall::new(
            "loop",
            "keep_going",
            json!({}),
        )])]));
        let agent = Agent::builder("looper")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(counting_tool("keep_going", Arc::clone(&executions)))
            .build()
            .unwrap();

        let err = Runner::run(&agent, "go", isolated().max_turns(3))
            .await
            .unwrap_err();

        assert!(err.is_max_turns());
        assert_eq!(err.turn, 3);
        assert_eq!(provider.call_count(), 3);
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn step_budget_forces_a_finish_with_last_assistant_text() {
        let provider = Arc::new(MockProvider::new(vec![ChatResponse::new(
            Message::assistant_with_tool_calls(
                Some("working on it".into()),
                vec![ToolCall::new("c1", "echo", json!({"x": 1}))],
            ),
        )
        .with_usage(Usage::new(10, 5))]));
        let agent = Agent::builder("bounded")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(echo_tool("echo"))
            .max_steps(1)
            .build()
            .unwrap();

        let result = Runner::run(&agent, "go", isolated()).await.unwrap();

        assert_eq!(provider.call_count(), 1);
        assert_eq!(result.metadata.finish_reason, StopReason::Length);
        // Tie-break kept the accompanying text in history, so the forced
        // finish can return it.
        assert_eq!(result.output_text(), Some("working on it"));
    }

    #[tokio::test]
    async fn forced_finish_skips_output_guardrails() {
        let ran = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(MockProvider::new(vec![calls(vec![ToolCall::new(
            "c1",
            "echo",
            json!({}),
        )])]));
        let agent = Agent::builder("bounded")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(echo_tool("echo"))
            .max_steps(1)
            .output_guardrail(OutputGuardrail::new(
                "recorder",
                RecordingOutputCheck(Arc::clone(&ran)),
            ))
            .build()
            .unwrap();

        let result = Runner::run(&agent, "go", isolated()).await.unwrap();
        assert_eq!(result.metadata.finish_reason, StopReason::Length);
        assert!(!ran.load(Ordering::SeqCst));
    }
}

mod dispatch {
    use super::*;

    #[tokio::test]
    async fn parallel_batch_preserves_call_order() {
        // Three 100 ms tools in one response finish
        // well under 180 ms and land in history in call order.
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![
                ToolCall::new("1", "t_a", json!({})),
                ToolCall::new("2", "t_b", json!({})),
                ToolCall::new("3", "t_c", json!({})),
            ]),
            text("all done"),
        ]));
        let agent = Agent::builder("fanout")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(sleepy_tool("t_a", 100))
            .tool(sleepy_tool("t_b", 100))
            .tool(sleepy_tool("t_c", 100))
            .build()
            .unwrap();

        let started = tokio::time::Instant::now();
        let result = Runner::run(&agent, "call all three", isolated())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(180), "dispatch serialised: {elapsed:?}");

        let result_names: Vec<&str> = result
            .items
            .iter()
            .filter_map(|item| match item {
                RunItem::ToolResult { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(result_names, ["t_a", "t_b", "t_c"]);
    }

    #[tokio::test]
    async fn every_tool_call_has_exactly_one_result() {
        // One result per call id, over mixed direct and background outputs.
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![
                ToolCall::new("a", "echo", json!({"n": 1})),
                ToolCall::new("b", "bg", json!({})),
            ]),
            text("done"),
        ]));
        let agent = Agent::builder("paired")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(echo_tool("echo"))
            .tool(FunctionTool::raw(
                "bg",
                "Defer",
                json!({"type": "object"}),
                |_| async {
                    Ok(ToolOutput::Background(BackgroundHandle::spawn(async {
                        Ok(json!("deferred"))
                    })))
                },
            ))
            .build()
            .unwrap();

        let result = Runner::run(&agent, "go", isolated()).await.unwrap();

        for item in &result.items {
            if let RunItem::ToolCall { id, .. } = item {
                let matching: Vec<_> = result
                    .items
                    .iter()
                    .filter(|other| matches!(other, RunItem::ToolResult { id: rid, .. } if rid == id))
                    .collect();
                assert_eq!(matching.len(), 1, "call {id} should have one result");
            }
        }
        // No background result is left unmaterialised.
        assert!(!result.items.iter().any(|item| matches!(
            item,
            RunItem::ToolResult { output: ToolResultPayload::InProgress, .. }
        )));
    }

    #[tokio::test]
    async fn failing_tool_is_fed_back_to_the_model() {
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![ToolCall::new("c1", "flaky", json!({}))]),
            text("recovered"),
        ]));
        let agent = Agent::builder("tolerant")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(FunctionTool::new(
                "flaky",
                "Always fails",
                json!({"type": "object"}),
                |_| async { Err(crate::error::ToolError::execution("boom")) },
            ))
            .build()
            .unwrap();

        let result = Runner::run(&agent, "go", isolated()).await.unwrap();

        assert_eq!(result.output_text(), Some("recovered"));
        // The failure reached the model as a tool message.
        let followup = &provider.requests()[1];
        let tool_msg = followup
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.text().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn consecutive_failures_exhaust_the_tool_budget() {
        let provider = Arc::new(MockProvider::new(vec![calls(vec![ToolCall::new(
            "c",
            "flaky",
            json!({}),
        )])]));
        let agent = Agent::builder("strict")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool_registration(
                ToolRegistration::new(FunctionTool::new(
                    "flaky",
                    "Always fails",
                    json!({"type": "object"}),
                    |_| async { Err(crate::error::ToolError::execution("boom")) },
                ))
                .max_consecutive_failures(2),
            )
            .build()
            .unwrap();

        let err = Runner::run(&agent, "go", isolated().max_turns(10))
            .await
            .unwrap_err();

        match err.kind {
            Error::ToolExecution { tool_name, failures, .. } => {
                assert_eq!(tool_name, "flaky");
                assert_eq!(failures, 2);
            }
            other => panic!("expected ToolExecution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn should_finish_predicate_ends_the_run_after_a_tool_round() {
        let provider = Arc::new(MockProvider::new(vec![ChatResponse::new(
            Message::assistant_with_tool_calls(
                Some("checking".into()),
                vec![ToolCall::new("c1", "echo", json!({}))],
            ),
        )]));
        let agent = Agent::builder("early")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(echo_tool("echo"))
            .should_finish(|_, items| {
                items
                    .iter()
                    .any(|i| matches!(i, RunItem::ToolResult { .. }))
            })
            .build()
            .unwrap();

        let result = Runner::run(&agent, "go", isolated()).await.unwrap();
        assert_eq!(provider.call_count(), 1);
        assert_eq!(result.output_text(), Some("checking"));
    }
}

mod approvals {
    use super::*;

    fn delete_file_agent(
        provider: Arc<MockProvider>,
        deleted: Arc<AtomicBool>,
    ) -> Agent {
        Agent::builder("careful")
            .provider(provider as SharedChatProvider)
            .tool_registration(
                ToolRegistration::new(FunctionTool::new(
                    "delete_file",
                    "Delete a file",
                    json!({"type": "object", "properties": {"path": {"type": "string"}}}),
                    move |_args| {
                        let deleted = Arc::clone(&deleted);
                        async move {
                            deleted.store(true, Ordering::SeqCst);
                            Ok(json!("deleted"))
                        }
                    },
                ))
                .requires_approval(true),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn rejection_is_localised_and_the_model_recovers() {
        let deleted = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![ToolCall::new("c1", "delete_file", json!({"path": "/tmp/x"}))]),
            text("I could not delete the file."),
        ]));
        let agent = delete_file_agent(Arc::clone(&provider), Arc::clone(&deleted));

        let result = Runner::run(
            &agent,
            "delete /tmp/x",
            isolated().approval_handler(Arc::new(AlwaysRejectHandler)),
        )
        .await
        .unwrap();

        // No side effect, and the rejection is visible in history.
        assert!(!deleted.load(Ordering::SeqCst));
        let rejection = result
            .items
            .iter()
            .find_map(|item| match item {
                RunItem::ToolResult { output: ToolResultPayload::Error { message }, .. } => {
                    Some(message.clone())
                }
                _ => None,
            })
            .unwrap();
        assert!(rejection.contains("rejected"));
        // The final message came from a follow-up LLM turn.
        assert_eq!(provider.call_count(), 2);
        assert_eq!(result.output_text(), Some("I could not delete the file."));
    }

    #[tokio::test]
    async fn approved_call_executes() {
        let deleted = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![ToolCall::new("c1", "delete_file", json!({"path": "/tmp/x"}))]),
            text("done"),
        ]));
        let agent = delete_file_agent(Arc::clone(&provider), Arc::clone(&deleted));

        Runner::run(
            &agent,
            "delete it",
            isolated().approval_handler(Arc::new(AutoApproveHandler)),
        )
        .await
        .unwrap();

        assert!(deleted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn gated_call_without_handler_fails_the_run() {
        let deleted = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![ToolCall::new("c1", "delete_file", json!({"path": "/tmp/x"}))]),
            text("unreachable"),
        ]));
        let agent = delete_file_agent(Arc::clone(&provider), Arc::clone(&deleted));

        let err = Runner::run(&agent, "delete it", isolated()).await.unwrap_err();
        assert!(matches!(err.kind, Error::ApprovalRequired { .. }));
        assert!(!deleted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn presupplied_decision_bypasses_the_handler() {
        let deleted = Arc::new(AtomicBool::new(false));
        let args = json!({"path": "/tmp/x"});
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![ToolCall::new("c1", "delete_file", args.clone())]),
            text("done"),
        ]));
        let agent = delete_file_agent(Arc::clone(&provider), Arc::clone(&deleted));

        // No handler configured; the pre-supplied decision carries it.
        Runner::run(
            &agent,
            "delete it",
            isolated().pre_approve("delete_file", &args, ApprovalDecision::approve()),
        )
        .await
        .unwrap();

        assert!(deleted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn out_of_band_approval_through_the_broker() {
        let deleted = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![ToolCall::new("c1", "delete_file", json!({"path": "/tmp/x"}))]),
            text("done"),
        ]));
        let agent = delete_file_agent(Arc::clone(&provider), Arc::clone(&deleted));

        let runtime = Arc::new(CoreRuntime::new());
        let broker = Arc::clone(runtime.approvals());

        // An "operator" polling the pending table and approving.
        let operator_broker = Arc::clone(&broker);
        let operator = tokio::spawn(async move {
            loop {
                let pending = operator_broker.pending();
                if let Some(record) = pending.first() {
                    operator_broker.submit(record.token, ApprovalDecision::approve());
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let config = RunConfig::new()
            .runtime(Arc::clone(&runtime))
            .approval_handler(broker.handler());
        Runner::run(&agent, "delete it", config).await.unwrap();

        operator.await.unwrap();
        assert!(deleted.load(Ordering::SeqCst));
    }
}

mod transfers {
    use super::*;

    fn transfer_call(target: &str) -> ChatResponse {
        calls(vec![ToolCall::new(
            "t1",
            format!("transfer_to_{target}"),
            json!({"reason": "needs expertise"}),
        )])
    }

    #[tokio::test]
    async fn transfer_switches_agents_and_records_the_chain() {
        let specialist_provider = Arc::new(MockProvider::new(vec![text("specialist answer")]));
        let specialist = Arc::new(
            Agent::builder("specialist")
                .instructions("You are the specialist.")
                .provider(Arc::clone(&specialist_provider) as SharedChatProvider)
                .build()
                .unwrap(),
        );

        let coordinator_provider = Arc::new(MockProvider::new(vec![transfer_call("specialist")]));
        let coordinator = Agent::builder("coordinator")
            .provider(Arc::clone(&coordinator_provider) as SharedChatProvider)
            .transfer(Arc::clone(&specialist))
            .build()
            .unwrap();

        let result = Runner::run(&coordinator, "help me", isolated()).await.unwrap();

        assert_eq!(result.output_text(), Some("specialist answer"));
        assert_eq!(result.final_agent, "specialist");
        assert_eq!(result.metadata.handoff_chain, ["coordinator", "specialist"]);
        assert_eq!(coordinator_provider.call_count(), 1);
        assert_eq!(specialist_provider.call_count(), 1);

        assert!(result.items.iter().any(|i| matches!(
            i,
            RunItem::TransferCall { from, to, reason: Some(r) }
                if from == "coordinator" && to == "specialist" && r == "needs expertise"
        )));
        assert!(result.items.iter().any(|i| matches!(
            i,
            RunItem::TransferResolved { from, to } if from == "coordinator" && to == "specialist"
        )));
    }

    #[tokio::test]
    async fn input_filter_rewrites_the_view_but_not_the_log() {
        // Keep-last-one shows the specialist exactly one user message
        // while the canonical log keeps all three.
        let specialist_provider = Arc::new(MockProvider::new(vec![text("helping now")]));
        let specialist = Arc::new(
            Agent::builder("specialist")
                .instructions("Specialist instructions.")
                .provider(Arc::clone(&specialist_provider) as SharedChatProvider)
                .build()
                .unwrap(),
        );

        let coordinator_provider = Arc::new(MockProvider::new(vec![transfer_call("specialist")]));
        let coordinator = Agent::builder("coordinator")
            .provider(Arc::clone(&coordinator_provider) as SharedChatProvider)
            .transfer_target(
                TransferTarget::new(Arc::clone(&specialist)).filter(InputFilter::KeepLastMessages(1)),
            )
            .build()
            .unwrap();

        let input = vec![
            Message::user("hello"),
            Message::user("ignore"),
            Message::user("now help"),
        ];
        let result = Runner::run(&coordinator, input, isolated()).await.unwrap();

        // The specialist's first call saw exactly one user message.
        let specialist_request = &specialist_provider.requests()[0];
        let user_messages: Vec<String> = specialist_request
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .filter_map(Message::text)
            .collect();
        assert_eq!(user_messages, ["now help"]);

        // The canonical log retains all three user inputs.
        let logged_users: Vec<String> = result
            .items
            .iter()
            .filter_map(|i| match i {
                RunItem::Message { message } if message.role == Role::User => message.text(),
                _ => None,
            })
            .collect();
        assert!(logged_users.contains(&"hello".to_owned()));
        assert!(logged_users.contains(&"ignore".to_owned()));
        assert!(logged_users.contains(&"now help".to_owned()));
    }

    #[tokio::test]
    async fn transfer_wins_over_tool_calls_in_the_same_response() {
        let executed = Arc::new(AtomicUsize::new(0));
        let specialist_provider = Arc::new(MockProvider::new(vec![text("done")]));
        let specialist = Arc::new(
            Agent::builder("specialist")
                .provider(Arc::clone(&specialist_provider) as SharedChatProvider)
                .build()
                .unwrap(),
        );

        let coordinator_provider = Arc::new(MockProvider::new(vec![calls(vec![
            ToolCall::new("c1", "count", json!({})),
            ToolCall::new("t1", "transfer_to_specialist", json!({})),
        ])]));
        let coordinator = Agent::builder("coordinator")
            .provider(Arc::clone(&coordinator_provider) as SharedChatProvider)
            .tool(counting_tool("count", Arc::clone(&executed)))
            .transfer(Arc::clone(&specialist))
            .build()
            .unwrap();

        let result = Runner::run(&coordinator, "go", isolated()).await.unwrap();

        assert_eq!(result.final_agent, "specialist");
        // The ordinary call was discarded, not executed.
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert!(
            result
                .metadata
                .warnings
                .iter()
                .any(|w| w.contains("count") && w.contains("discarded"))
        );
    }

    #[tokio::test]
    async fn output_equals_direct_run_plus_the_transfer_turn() {
        // Transfer-then-finish totals: the direct run plus one turn.
        let make_specialist = || {
            Arc::new(
                Agent::builder("specialist")
                    .provider(Arc::new(MockProvider::new(vec![text("final answer")]))
                        as SharedChatProvider)
                    .build()
                    .unwrap(),
            )
        };

        let direct = Runner::run(&make_specialist(), "question", isolated())
            .await
            .unwrap();

        let coordinator = Agent::builder("coordinator")
            .provider(Arc::new(MockProvider::new(vec![transfer_call("specialist")]))
                as SharedChatProvider)
            .transfer(make_specialist())
            .build()
            .unwrap();
        let via_transfer = Runner::run(&coordinator, "question", isolated())
            .await
            .unwrap();

        assert_eq!(via_transfer.output, direct.output);
        assert_eq!(via_transfer.metadata.turns, direct.metadata.turns + 1);
        // One transfer turn's worth of extra tokens.
        assert_eq!(
            via_transfer.metadata.usage,
            direct.metadata.usage + Usage::new(10, 5)
        );
    }

    #[tokio::test]
    async fn new_agents_input_guardrails_run_on_activation() {
        let specialist_provider = Arc::new(MockProvider::new(vec![text("never")]));
        let specialist = Arc::new(
            Agent::builder("guarded")
                .provider(Arc::clone(&specialist_provider) as SharedChatProvider)
                .input_guardrail(InputGuardrail::new("blocklist", Blocklist("help")))
                .build()
                .unwrap(),
        );

        let coordinator = Agent::builder("coordinator")
            .provider(Arc::new(MockProvider::new(vec![transfer_call("guarded")]))
                as SharedChatProvider)
            .transfer(Arc::clone(&specialist))
            .build()
            .unwrap();

        let err = Runner::run(&coordinator, "help me", isolated()).await.unwrap_err();

        assert!(err.is_tripwire());
        assert_eq!(err.agent, "guarded");
        // The guarded agent never reached its LLM.
        assert_eq!(specialist_provider.call_count(), 0);
    }
}

mod guardrails {
    use super::*;

    #[tokio::test]
    async fn input_tripwire_prevents_any_llm_call() {
        let ran_output = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(MockProvider::new(vec![text("leak")]));
        let agent = Agent::builder("guarded")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .input_guardrail(InputGuardrail::new("secret-filter", Blocklist("SECRET")))
            .output_guardrail(OutputGuardrail::new(
                "recorder",
                RecordingOutputCheck(Arc::clone(&ran_output)),
            ))
            .build()
            .unwrap();

        let err = Runner::run(&agent, "tell me the SECRET", isolated())
            .await
            .unwrap_err();

        assert_eq!(provider.call_count(), 0);
        match &err.kind {
            Error::GuardrailTripwire { guardrail, phase, .. } => {
                assert_eq!(guardrail, "secret-filter");
                assert_eq!(*phase, GuardrailPhase::In);
            }
            other => panic!("expected tripwire, got {other:?}"),
        }
        assert!(!ran_output.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn passing_checks_are_recorded_as_items() {
        let provider = Arc::new(MockProvider::new(vec![text("fine")]));
        let ran_output = Arc::new(AtomicBool::new(false));
        let agent = Agent::builder("checked")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .input_guardrail(InputGuardrail::new("secret-filter", Blocklist("SECRET")))
            .output_guardrail(OutputGuardrail::new(
                "recorder",
                RecordingOutputCheck(Arc::clone(&ran_output)),
            ))
            .build()
            .unwrap();

        let result = Runner::run(&agent, "all good", isolated()).await.unwrap();

        let checks: Vec<(&str, GuardrailPhase, bool)> = result
            .items
            .iter()
            .filter_map(|i| match i {
                RunItem::GuardrailCheck { name, phase, passed, .. } => {
                    Some((name.as_str(), *phase, *passed))
                }
                _ => None,
            })
            .collect();
        assert!(checks.contains(&("secret-filter", GuardrailPhase::In, true)));
        assert!(checks.contains(&("recorder", GuardrailPhase::Out, true)));
        assert!(ran_output.load(Ordering::SeqCst));
    }

    struct NoDigits;

    #[async_trait::async_trait]
    impl OutputGuardrailCheck for NoDigits {
        async fn check(
            &self,
            _ctx: &RunContext,
            _agent: &str,
            output: &Value,
        ) -> crate::error::Result<GuardrailOutput> {
            if output.as_str().unwrap_or_default().chars().any(|c| c.is_ascii_digit()) {
                Ok(GuardrailOutput::tripwire("digits leaked"))
            } else {
                Ok(GuardrailOutput::pass())
            }
        }
    }

    #[tokio::test]
    async fn output_tripwire_fails_the_run() {
        let provider = Arc::new(MockProvider::new(vec![text("the code is 1234")]));
        let agent = Agent::builder("leaky")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .output_guardrail(OutputGuardrail::new("no-digits", NoDigits))
            .build()
            .unwrap();

        let err = Runner::run(&agent, "what's the code?", isolated())
            .await
            .unwrap_err();

        assert!(err.is_tripwire());
        match err.kind {
            Error::GuardrailTripwire { phase, .. } => assert_eq!(phase, GuardrailPhase::Out),
            other => panic!("expected tripwire, got {other:?}"),
        }
    }
}

mod background {
    use super::*;

    #[tokio::test]
    async fn background_result_materialises_before_done() {
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![ToolCall::new("bg1", "kick_off", json!({}))]),
            text("kicked off, summarising"),
        ]));
        let agent = Agent::builder("deferred")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(FunctionTool::raw(
                "kick_off",
                "Start a long job",
                json!({"type": "object"}),
                |_| async {
                    Ok(ToolOutput::Background(BackgroundHandle::spawn(async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({"job": "finished"}))
                    })))
                },
            ))
            .build()
            .unwrap();

        let result = Runner::run(&agent, "kick it off and summarise", isolated())
            .await
            .unwrap();

        // The model saw an in-progress marker on its follow-up turn.
        let followup = &provider.requests()[1];
        let tool_msg = followup.messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.text().unwrap().contains("background"));

        // The final log and messages carry the materialised value.
        let payload = result
            .items
            .iter()
            .find_map(|i| match i {
                RunItem::ToolResult { id, output, .. } if id == "bg1" => Some(output.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(payload.as_value().unwrap()["job"], "finished");

        let persisted = result
            .new_messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("bg1"))
            .unwrap();
        assert!(persisted.text().unwrap().contains("finished"));
        assert!(result.metadata.warnings.is_empty());
    }

    #[tokio::test]
    async fn failed_background_result_becomes_a_warning() {
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![ToolCall::new("bg1", "doomed", json!({}))]),
            text("summary"),
        ]));
        let agent = Agent::builder("deferred")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(FunctionTool::raw(
                "doomed",
                "Fails later",
                json!({"type": "object"}),
                |_| async {
                    Ok(ToolOutput::Background(BackgroundHandle::spawn(async {
                        Err(crate::error::ToolError::execution("background boom"))
                    })))
                },
            ))
            .build()
            .unwrap();

        let result = Runner::run(&agent, "go", isolated()).await.unwrap();

        // The failure never changes the final output, only the metadata.
        assert_eq!(result.output_text(), Some("summary"));
        assert!(
            result
                .metadata
                .warnings
                .iter()
                .any(|w| w.contains("doomed") && w.contains("background boom"))
        );
    }
}

mod structured_output {
    use super::*;

    fn answer_schema() -> OutputSchema {
        OutputSchema::new(
            "answer",
            json!({
                "type": "object",
                "properties": {"answer": {"type": "integer"}},
                "required": ["answer"]
            }),
        )
    }

    #[tokio::test]
    async fn invalid_output_gets_one_corrective_retry() {
        let provider = Arc::new(MockProvider::new(vec![
            text("sorry, plain text"),
            text(r#"{"answer": 42}"#),
        ]));
        let agent = Agent::builder("structured")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .output_schema(answer_schema())
            .build()
            .unwrap();

        let result = Runner::run(&agent, "answer?", isolated()).await.unwrap();

        assert_eq!(provider.call_count(), 2);
        assert_eq!(result.output["answer"], 42);

        // The corrective user message went into the second request.
        let retry_request = &provider.requests()[1];
        let corrective = retry_request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .unwrap();
        assert!(corrective.text().unwrap().contains("schema"));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_a_structured_output_error() {
        let provider = Arc::new(MockProvider::new(vec![text("never json")]));
        let agent = Agent::builder("structured")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .output_schema(answer_schema())
            .build()
            .unwrap();

        let err = Runner::run(&agent, "answer?", isolated()).await.unwrap_err();
        assert!(matches!(err.kind, Error::StructuredOutputInvalid { .. }));
        // Default policy: one retry, so two calls in total.
        assert_eq!(provider.call_count(), 2);
    }
}

mod sessions {
    use super::*;

    #[tokio::test]
    async fn prior_history_prefixes_the_prompt_and_new_messages_append() {
        let session = Arc::new(InMemorySession::with_messages(
            "s1",
            vec![Message::user("earlier question"), Message::assistant("earlier answer")],
        ));
        let provider = Arc::new(MockProvider::new(vec![text("fresh answer")]));
        let agent = Agent::builder("remembering")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .build()
            .unwrap();

        let result = Runner::run(
            &agent,
            "new question",
            isolated().session(Arc::clone(&session) as crate::session::SharedSession),
        )
        .await
        .unwrap();

        // The request saw the prior history before the new input.
        let request = &provider.requests()[0];
        let texts: Vec<String> = request.messages.iter().filter_map(Message::text).collect();
        assert_eq!(texts, ["earlier question", "earlier answer", "new question"]);

        // Only the new messages were appended.
        assert_eq!(session.len().await.unwrap(), 4);
        let stored = session.get_messages(None).await.unwrap();
        assert_eq!(stored[2].text().as_deref(), Some("new question"));
        assert_eq!(stored[3].text().as_deref(), Some("fresh answer"));
        assert_eq!(result.new_messages.len(), 2);
    }

    #[tokio::test]
    async fn failed_run_persists_only_integrated_steps() {
        // Two tool rounds scripted, but the second turn trips the budget:
        // only the first round's messages reach the session.
        let session = Arc::new(InMemorySession::new("s2"));
        let provider = Arc::new(MockProvider::new(vec![calls(vec![ToolCall::new(
            "c1",
            "echo",
            json!({}),
        )])]));
        let agent = Agent::builder("doomed")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(echo_tool("echo"))
            .build()
            .unwrap();

        let err = Runner::run(
            &agent,
            "go",
            isolated()
                .session(Arc::clone(&session) as crate::session::SharedSession)
                .max_turns(2),
        )
        .await
        .unwrap_err();
        assert!(err.is_max_turns());

        let stored = session.get_messages(None).await.unwrap();
        // The input plus the first integrated tool round; the second turn
        // died on the budget before integrating anything.
        assert_eq!(stored[0].text().as_deref(), Some("go"));
        assert_eq!(stored.len(), 3);
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn cancel_during_generation_discards_the_partial_step() {
        let provider = Arc::new(
            MockProvider::new(vec![text("too late")]).with_delay(Duration::from_millis(200)),
        );
        let agent = Agent::builder("cancellable")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .build()
            .unwrap();

        let token = CancelToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = Runner::run(&agent, "hi", isolated().cancel_token(token.clone()))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        // Same observable history as cancelling between steps: the
        // partial step left no trace beyond the input itself.
        let immediate = CancelToken::new();
        immediate.cancel();
        let err2 = Runner::run(&agent, "hi", isolated().cancel_token(immediate))
            .await
            .unwrap_err();
        assert!(err2.is_cancelled());

        // Cancellation is idempotent.
        token.cancel();
        assert!(token.is_cancelled());
    }
}

mod agent_as_tool {
    use super::*;

    #[tokio::test]
    async fn child_agent_output_flows_through_the_tool() {
        // The tool-mediated child output equals the direct run output.
        let make_child = || {
            Arc::new(
                Agent::builder("translator")
                    .provider(Arc::new(MockProvider::new(vec![text("bonjour")]))
                        as SharedChatProvider)
                    .build()
                    .unwrap(),
            )
        };

        let direct = Runner::run(&make_child(), "hello", isolated()).await.unwrap();

        let child = make_child();
        let parent_provider = Arc::new(MockProvider::new(vec![
            calls(vec![ToolCall::new("c1", "translator", json!({"input": "hello"}))]),
            text("relayed"),
        ]));
        let parent = Agent::builder("parent")
            .provider(Arc::clone(&parent_provider) as SharedChatProvider)
            .tool(child.as_tool())
            .build()
            .unwrap();

        let result = Runner::run(&parent, "translate hello", isolated())
            .await
            .unwrap();

        let tool_value = result
            .items
            .iter()
            .find_map(|i| match i {
                RunItem::ToolResult { name, output, .. } if name == "translator" => {
                    output.as_value().cloned()
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(tool_value, direct.output);
    }
}

mod streaming {
    use super::*;
    use crate::agent::events::{RunEvent, text_stream};

    fn event_label(event: &RunEvent) -> &'static str {
        match event {
            RunEvent::RawModelDelta { .. } => "delta",
            RunEvent::MessageOutput { .. } => "message",
            RunEvent::ToolCall { .. } => "tool-call",
            RunEvent::ToolResult { .. } => "tool-result",
            RunEvent::Transfer { .. } => "transfer",
            RunEvent::ApprovalRequired { .. } => "approval-required",
            RunEvent::StepFinish { .. } => "step-finish",
            RunEvent::Guardrail { .. } => "guardrail",
            RunEvent::AgentUpdated { .. } => "agent-updated",
            RunEvent::Finish { .. } => "finish",
        }
    }

    #[tokio::test]
    async fn events_arrive_in_step_order_and_end_with_finish() {
        let provider = Arc::new(
            MockProvider::new(vec![
                calls(vec![ToolCall::new("c1", "echo", json!({"n": 1}))]),
                text("done"),
            ])
            .with_streaming(),
        );
        let agent = Agent::builder("streamer")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool(echo_tool("echo"))
            .build()
            .unwrap();

        let events: Vec<_> = Runner::run_streamed(&agent, "go", isolated())
            .collect()
            .await;
        let labels: Vec<&str> = events
            .iter()
            .map(|e| event_label(e.as_ref().expect("no errors")))
            .collect();

        assert_eq!(labels.first(), Some(&"agent-updated"));
        assert_eq!(labels.last(), Some(&"finish"));

        // Step 1's tool events precede step 2's message output.
        let tool_result_pos = labels.iter().position(|l| *l == "tool-result").unwrap();
        let first_step_finish = labels.iter().position(|l| *l == "step-finish").unwrap();
        let last_message_pos = labels.iter().rposition(|l| *l == "message").unwrap();
        assert!(tool_result_pos < first_step_finish);
        assert!(first_step_finish < last_message_pos);

        // Two steps, two step-finish events.
        assert_eq!(labels.iter().filter(|l| **l == "step-finish").count(), 2);

        let finish = events.last().unwrap().as_ref().unwrap();
        match finish {
            RunEvent::Finish { result } => {
                assert_eq!(result.output_text(), Some("done"));
                assert_eq!(result.metadata.turns, 2);
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_stream_concatenates_deltas() {
        let provider = Arc::new(MockProvider::new(vec![text("hello world")]).with_streaming());
        let agent = Agent::builder("texter")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .build()
            .unwrap();

        let stream = Runner::run_streamed(&agent, "hi", isolated());
        let collected: String = text_stream(stream).collect::<Vec<_>>().await.concat();
        assert_eq!(collected, "hello world");
    }

    #[tokio::test]
    async fn non_streaming_provider_degrades_to_one_delta_per_turn() {
        let provider = Arc::new(MockProvider::new(vec![text("whole message")]));
        let agent = Agent::builder("fallback")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .build()
            .unwrap();

        let events: Vec<_> = Runner::run_streamed(&agent, "hi", isolated())
            .collect()
            .await;
        let deltas = events
            .iter()
            .filter(|e| matches!(e, Ok(RunEvent::RawModelDelta { .. })))
            .count();
        assert_eq!(deltas, 1);
    }

    #[tokio::test]
    async fn tripwire_ends_the_stream_with_an_error() {
        let provider = Arc::new(MockProvider::new(vec![text("never")]));
        let agent = Agent::builder("guarded")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .input_guardrail(InputGuardrail::new("secret-filter", Blocklist("SECRET")))
            .build()
            .unwrap();

        let events: Vec<_> = Runner::run_streamed(&agent, "the SECRET please", isolated())
            .collect()
            .await;

        let last = events.last().unwrap();
        match last {
            Err(err) => assert!(err.is_tripwire()),
            Ok(other) => panic!("expected terminal error, got {other:?}"),
        }
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn approval_required_is_observable_before_the_result() {
        let provider = Arc::new(MockProvider::new(vec![
            calls(vec![ToolCall::new("c1", "gated", json!({}))]),
            text("done"),
        ]));
        let agent = Agent::builder("gated-streamer")
            .provider(Arc::clone(&provider) as SharedChatProvider)
            .tool_registration(
                ToolRegistration::new(echo_tool("gated")).requires_approval(true),
            )
            .build()
            .unwrap();

        let events: Vec<_> = Runner::run_streamed(
            &agent,
            "go",
            isolated().approval_handler(Arc::new(AutoApproveHandler)),
        )
        .collect()
        .await;

        let labels: Vec<&str> = events
            .iter()
            .filter_map(|e| e.as_ref().ok().map(event_label))
            .collect();
        let approval_pos = labels.iter().position(|l| *l == "approval-required").unwrap();
        let result_pos = labels.iter().position(|l| *l == "tool-result").unwrap();
        assert!(approval_pos < result_pos);
    }
}
