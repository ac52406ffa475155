//! 单轮对话循环
//!
//! AwaitingModel -> (无调用) Finalized；AwaitingModel -> (有调用) Dispatching -> AwaitingModel。
//! 工具轮数受 max_tool_rounds 约束，超出后本次请求的调用不派发，直接以清洗后的文本结束。
//! 取消只在模型调用前与模型调用期间生效；已派发的工具调用总会完成并写入日志。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::ChatError;
use crate::llm::CallUsage;
use crate::memory::Message;
use crate::react::parser::DEFAULT_MAX_BLOCK_CHARS;
use crate::react::planner::send;
use crate::react::{Planner, TurnEvent, TurnPhase};
use crate::session::{Session, TranscriptMessage, UsageRecord};
use crate::tools::{ToolDispatcher, ToolInvocation};

/// 单轮内最大工具轮数，防止死循环
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 5;

/// 单轮对话所需的组件与限制
pub struct TurnContext<'a> {
    pub planner: &'a Planner,
    pub dispatcher: &'a ToolDispatcher,
    pub cancel_token: CancellationToken,
    pub max_tool_rounds: usize,
    pub max_block_chars: usize,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a UnboundedSender<TurnEvent>>,
}

impl<'a> TurnContext<'a> {
    pub fn new(
        planner: &'a Planner,
        dispatcher: &'a ToolDispatcher,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            planner,
            dispatcher,
            cancel_token,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            max_block_chars: DEFAULT_MAX_BLOCK_CHARS,
            event_tx: None,
        }
    }

    pub fn with_max_tool_rounds(mut self, max_tool_rounds: usize) -> Self {
        self.max_tool_rounds = max_tool_rounds;
        self
    }

    pub fn with_max_block_chars(mut self, max_block_chars: usize) -> Self {
        self.max_block_chars = max_block_chars;
        self
    }

    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<TurnEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

/// 一轮的结果：可见回复与本轮新增的可见记录
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub session_id: String,
    pub reply: String,
    pub transcript: Vec<TranscriptMessage>,
    /// 实际派发的工具轮数
    pub rounds: usize,
    pub hit_round_limit: bool,
    /// 本轮被丢弃的协议块数量
    pub diagnostics: usize,
    pub usage: Option<UsageRecord>,
}

/// 在已加锁的会话上跑一轮
pub async fn run_turn(
    ctx: &TurnContext<'_>,
    session: &mut Session,
    user_message: &str,
) -> Result<TurnOutcome, ChatError> {
    if !session.is_open() {
        return Err(ChatError::SessionClosed(session.id.clone()));
    }
    let start = session.messages().len();
    session.push_message(Message::user(user_message));

    let system = ctx.planner.build_system(ctx.dispatcher.registry());
    let mut usage = CallUsage::default();
    let mut rounds = 0usize;
    let mut hit_round_limit = false;
    let mut diagnostics = 0usize;

    loop {
        if ctx.cancel_token.is_cancelled() {
            return Err(cancelled(ctx, session, usage, rounds));
        }
        let messages = Planner::model_context(&system, session.messages());
        let generated = tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => {
                return Err(cancelled(ctx, session, usage, rounds));
            }
            r = ctx.planner.generate(&messages, ctx.max_block_chars, rounds, ctx.event_tx) => r,
        };
        let output = match generated {
            Ok(done) => {
                usage.add(done.value.usage);
                done.value.output
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, attempts = e.attempts, error = %e.error, "model call failed");
                session.mark_degraded();
                record_usage(ctx, session, usage);
                send(ctx.event_tx, TurnEvent::Error { text: e.error.to_string() });
                return Err(ChatError::Model {
                    source: e.error,
                    attempts: e.attempts,
                });
            }
        };
        diagnostics += output.diagnostics.len();

        if output.invocations.is_empty() {
            session.push_message(Message::assistant(output.text));
            break;
        }

        if rounds >= ctx.max_tool_rounds {
            tracing::warn!(
                session_id = %session.id,
                max_rounds = ctx.max_tool_rounds,
                skipped = output.invocations.len(),
                "tool round limit reached, finalizing without dispatch"
            );
            send(
                ctx.event_tx,
                TurnEvent::RoundLimit {
                    max_rounds: ctx.max_tool_rounds,
                    skipped: output.invocations.len(),
                },
            );
            hit_round_limit = true;
            session.push_message(Message::assistant(output.text));
            break;
        }

        let invocations: Vec<ToolInvocation> = output
            .invocations
            .into_iter()
            .map(|c| ToolInvocation::new(c.name, c.arguments))
            .collect();
        session.push_message(Message::assistant_with_calls(
            output.text,
            invocations.clone(),
        ));

        send(
            ctx.event_tx,
            TurnEvent::Phase {
                phase: TurnPhase::Dispatching,
                round: rounds,
            },
        );
        for inv in &invocations {
            send(
                ctx.event_tx,
                TurnEvent::ToolCall {
                    id: inv.id.clone(),
                    name: inv.name.clone(),
                    arguments: inv.arguments.clone(),
                },
            );
        }
        tracing::debug!(session_id = %session.id, round = rounds, calls = invocations.len(), "dispatching tool calls");

        for result in ctx.dispatcher.dispatch(&invocations).await {
            send(
                ctx.event_tx,
                TurnEvent::ToolResult {
                    id: result.invocation_id.clone(),
                    name: result.tool_name.clone(),
                    status: result.status,
                    attempts: result.attempts,
                    duration_ms: result.duration_ms,
                },
            );
            session.push_message(Message::tool(
                result.invocation_id.clone(),
                result.to_message_content(),
            ));
            session.push_tool_result(result);
        }
        rounds += 1;
    }

    let reply = session
        .messages()
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let usage = record_usage(ctx, session, usage);
    send(
        ctx.event_tx,
        TurnEvent::Phase {
            phase: TurnPhase::Finalized,
            round: rounds,
        },
    );
    send(ctx.event_tx, TurnEvent::Done);
    tracing::info!(session_id = %session.id, rounds, hit_round_limit, diagnostics, "turn finalized");

    Ok(TurnOutcome {
        session_id: session.id.clone(),
        reply,
        transcript: session.transcript_from(start),
        rounds,
        hit_round_limit,
        diagnostics,
        usage,
    })
}

fn cancelled(
    ctx: &TurnContext<'_>,
    session: &mut Session,
    usage: CallUsage,
    rounds: usize,
) -> ChatError {
    tracing::info!(session_id = %session.id, rounds, "turn cancelled");
    record_usage(ctx, session, usage);
    ChatError::Cancelled
}

/// 记录本轮各次模型调用的用量之和；为零时不写
fn record_usage(
    ctx: &TurnContext<'_>,
    session: &mut Session,
    usage: CallUsage,
) -> Option<UsageRecord> {
    if usage.is_empty() {
        return None;
    }
    let record = UsageRecord {
        model: ctx.planner.model_name().to_string(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        timestamp: chrono::Utc::now(),
    };
    send(
        ctx.event_tx,
        TurnEvent::Usage {
            prompt_tokens: record.prompt_tokens,
            completion_tokens: record.completion_tokens,
        },
    );
    session.record_usage(record.clone());
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RetryPolicy;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::memory::Role;
    use crate::tools::{shop_registry, ExecutorError, ToolExecutor, ToolRequest, ToolStatus};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct CartExecutor;

    #[async_trait]
    impl ToolExecutor for CartExecutor {
        async fn execute(&self, request: &ToolRequest) -> Result<Value, ExecutorError> {
            match request.tool.as_str() {
                "get_cart" => Ok(json!({"id": "cart_1", "lines": [], "total": "0.00"})),
                _ => Ok(json!("{\"products\": []}")),
            }
        }
    }

    fn fixtures(mock: MockLlmClient) -> (Planner, ToolDispatcher) {
        let planner = Planner::new(Arc::new(mock), "sys").with_retry(RetryPolicy::immediate(2));
        let dispatcher =
            ToolDispatcher::new(Arc::new(shop_registry()), Arc::new(CartExecutor))
                .with_retry(RetryPolicy::immediate(2));
        (planner, dispatcher)
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let mock = MockLlmClient::scripted([
            r#"Let me check your cart. <|call|>{"name":"get_cart","arguments":{}}<|end|>"#,
            "Your cart is empty.",
        ])
        .with_chunk_chars(4);
        let (planner, dispatcher) = fixtures(mock);
        let ctx = TurnContext::new(&planner, &dispatcher, CancellationToken::new());
        let mut session = Session::new("s1");

        let out = run_turn(&ctx, &mut session, "what's in my cart?").await.unwrap();
        assert_eq!(out.reply, "Your cart is empty.");
        assert_eq!(out.rounds, 1);
        assert!(!out.hit_round_limit);

        let roles: Vec<Role> = session.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(session.messages()[1].content, "Let me check your cart.");
        assert_eq!(session.tool_results()[0].status, ToolStatus::Success);
        assert_eq!(out.transcript.len(), 4);
        // 两次模型调用的用量之和
        assert_eq!(out.usage.as_ref().map(|u| u.prompt_tokens), Some(20));
        assert_eq!(session.usage().len(), 1);
    }

    #[tokio::test]
    async fn test_round_limit_forces_finalize() {
        let call = r#"Checking again <|call|>{"name":"get_cart"}<|end|>"#;
        let mock = MockLlmClient::scripted([call, call, call]);
        let (planner, dispatcher) = fixtures(mock);
        let ctx = TurnContext::new(&planner, &dispatcher, CancellationToken::new())
            .with_max_tool_rounds(2);
        let mut session = Session::new("s1");

        let out = run_turn(&ctx, &mut session, "cart").await.unwrap();
        assert!(out.hit_round_limit);
        assert_eq!(out.rounds, 2);
        assert_eq!(out.reply, "Checking again");
        assert_eq!(session.tool_results().len(), 2);
        let last = session.messages().last().unwrap();
        assert!(!last.has_tool_calls());
    }

    #[tokio::test]
    async fn test_fatal_model_error_marks_degraded() {
        let mock = MockLlmClient::new();
        mock.push_error(LlmError::Api("invalid key".into()));
        let (planner, dispatcher) = fixtures(mock);
        let ctx = TurnContext::new(&planner, &dispatcher, CancellationToken::new());
        let mut session = Session::new("s1");

        let err = run_turn(&ctx, &mut session, "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::Model { attempts: 1, .. }));
        assert!(session.degraded());
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_model_call() {
        let (planner, dispatcher) = fixtures(MockLlmClient::new());
        let token = CancellationToken::new();
        token.cancel();
        let ctx = TurnContext::new(&planner, &dispatcher, token);
        let mut session = Session::new("s1");
        let err = run_turn(&ctx, &mut session, "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::Cancelled));
        assert_eq!(session.messages()[0].content, "hi");
    }

    #[tokio::test]
    async fn test_closed_session_rejects_turn() {
        let (planner, dispatcher) = fixtures(MockLlmClient::new());
        let ctx = TurnContext::new(&planner, &dispatcher, CancellationToken::new());
        let mut session = Session::new("s1");
        session.close();
        assert!(matches!(
            run_turn(&ctx, &mut session, "hi").await,
            Err(ChatError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_events_never_carry_markers() {
        let mock = MockLlmClient::scripted([
            r#"Sure<|ca"#.to_string() + r#"ll|>{"name":"search_shop_catalog","arguments":{"query":"mug"}}<|end|>"#,
            "Found none.".to_string(),
        ])
        .with_chunk_chars(2);
        let (planner, dispatcher) = fixtures(mock);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = TurnContext::new(&planner, &dispatcher, CancellationToken::new()).with_event_tx(&tx);
        let mut session = Session::new("s1");
        run_turn(&ctx, &mut session, "mugs?").await.unwrap();
        drop(ctx);
        drop(tx);

        let mut saw_done = false;
        while let Some(ev) = rx.recv().await {
            let json = serde_json::to_string(&ev).unwrap();
            if let TurnEvent::TextDelta { text } = &ev {
                assert!(!text.contains('{'), "{json}");
            }
            saw_done |= matches!(ev, TurnEvent::Done);
        }
        assert!(saw_done);
        for m in session.transcript() {
            assert!(!m.text.contains("<|"));
            assert!(!m.text.contains("query"));
        }
    }

    #[tokio::test]
    async fn test_spliced_markers_dispatch_and_never_stream_for_any_chunk_size() {
        let spliced = "<|ca<|end|>ll|>{\"name\":\"get_cart\"}<|end|>tail";
        for size in 1..=10 {
            let mock = MockLlmClient::scripted([spliced, "Your cart is empty."])
                .with_chunk_chars(size);
            let (planner, dispatcher) = fixtures(mock);
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let ctx = TurnContext::new(&planner, &dispatcher, CancellationToken::new())
                .with_event_tx(&tx);
            let mut session = Session::new("s1");
            let out = run_turn(&ctx, &mut session, "cart?").await.unwrap();
            drop(ctx);
            drop(tx);

            assert_eq!(out.rounds, 1, "chunk size {size}");
            assert_eq!(session.tool_results().len(), 1, "chunk size {size}");
            assert_eq!(session.messages()[1].content, "tail");
            assert_eq!(out.reply, "Your cart is empty.");

            let mut streamed = String::new();
            while let Some(ev) = rx.recv().await {
                if let TurnEvent::TextDelta { text } = ev {
                    streamed.push_str(&text);
                }
            }
            assert!(!streamed.contains("<|"), "chunk size {size}: {streamed:?}");
            assert!(!streamed.contains("get_cart"), "chunk size {size}: {streamed:?}");
            assert!(streamed.starts_with("tail"), "chunk size {size}: {streamed:?}");
        }
    }
}
