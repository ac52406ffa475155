//! Planner：拼装模型上下文并执行一次生成
//!
//! system prompt = 基础提示词 + 已登记工具说明 + 调用块 Schema。会话日志里的 assistant 消息只保存
//! 清洗后的文本与结构化调用；发给模型时把调用重新编码为 `<|call|>` 块，模型因此能看到自己之前的调用。
//! 每次生成都把流式输出逐片喂给新的 ToolCallParser，失败按 RetryPolicy 整体重试。

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;

use crate::core::retry::{self, Attempted, RetryError, RetryPolicy};
use crate::llm::{CallUsage, LlmClient, LlmError, StreamChunk};
use crate::memory::{Message, Role};
use crate::react::parser::{ParseOutput, ToolCallParser, CALL_END, CALL_START};
use crate::react::{TurnEvent, TurnPhase};
use crate::tools::{tool_call_schema_json, ToolRegistry};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the shopping assistant of an online store. \
Answer briefly and only with facts returned by tools. Never invent prices, stock or order details.";

/// 一次成功生成：解析结果与该次调用的用量
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub output: ParseOutput,
    pub usage: CallUsage,
}

/// Planner：持有 LLM 与 system prompt
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// 完整 system prompt（含工具说明与调用格式）
    pub fn build_system(&self, registry: &ToolRegistry) -> String {
        format!(
            "{base}\n\n## Tools\n\nAvailable tools (JSON Schema of their arguments):\n{tools}\n\n\
## Calling a tool\n\nTo call a tool, write {start}{{\"name\": \"<tool>\", \"arguments\": {{...}}}}{end} \
on its own. You may call several tools in one reply; they run in the order written. \
Block content must match this schema:\n{schema}\n\n\
Tool results come back as messages of the form {{\"status\": ..., \"result\" | \"error\": ...}}. \
Never show tool JSON or call markers to the customer.",
            base = self.system_prompt,
            tools = registry.to_schema_json(),
            start = CALL_START,
            end = CALL_END,
            schema = tool_call_schema_json(),
        )
    }

    /// 模型看到的上下文：system + 会话日志（调用重新编码为协议块）
    pub fn model_context(system: &str, log: &[Message]) -> Vec<Message> {
        let mut messages = Vec::with_capacity(log.len() + 1);
        messages.push(Message::system(system.to_string()));
        for m in log {
            if m.role == Role::Assistant && m.has_tool_calls() {
                let mut encoded = m.clone();
                for call in &m.tool_calls {
                    let block = serde_json::json!({ "name": call.name, "arguments": call.arguments });
                    encoded.content.push_str(CALL_START);
                    encoded.content.push_str(&block.to_string());
                    encoded.content.push_str(CALL_END);
                }
                messages.push(encoded);
            } else {
                messages.push(m.clone());
            }
        }
        messages
    }

    /// 一次生成：流式读取并解析；打开流或读取中途失败时按策略整体重试
    ///
    /// 每次尝试开始时推送 Phase(AwaitingModel)，重试时前端据此丢弃上一次的片段。
    pub async fn generate(
        &self,
        messages: &[Message],
        max_block_chars: usize,
        round: usize,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> Result<Attempted<Generation>, RetryError<LlmError>> {
        let request_timeout = self.request_timeout;
        retry::run(
            &self.retry,
            move |_attempt| async move {
                send(
                    events,
                    TurnEvent::Phase {
                        phase: TurnPhase::AwaitingModel,
                        round,
                    },
                );
                match timeout(
                    request_timeout,
                    self.generate_once(messages, max_block_chars, events),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(LlmError::Timeout),
                }
            },
            LlmError::classify,
        )
        .await
    }

    async fn generate_once(
        &self,
        messages: &[Message],
        max_block_chars: usize,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> Result<Generation, LlmError> {
        let mut stream = self.llm.complete_stream(messages).await?;
        let mut parser = ToolCallParser::new(max_block_chars);
        let mut output = ParseOutput::default();
        let mut usage = CallUsage::default();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Text(text) => {
                    let part = parser.feed(&text);
                    emit_text(events, &part.text);
                    output.merge(part);
                }
                StreamChunk::Usage(u) => usage.add(u),
            }
        }
        let tail = parser.finish();
        emit_text(events, &tail.text);
        output.merge(tail);
        output.text = output.text.trim().to_string();
        Ok(Generation { output, usage })
    }
}

fn emit_text(events: Option<&UnboundedSender<TurnEvent>>, text: &str) {
    if !text.is_empty() {
        send(
            events,
            TurnEvent::TextDelta {
                text: text.to_string(),
            },
        );
    }
}

pub(crate) fn send(tx: Option<&UnboundedSender<TurnEvent>>, ev: TurnEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::tools::{shop_registry, ToolInvocation};
    use serde_json::json;

    fn planner(mock: MockLlmClient) -> Planner {
        Planner::new(Arc::new(mock), DEFAULT_SYSTEM_PROMPT)
            .with_retry(RetryPolicy::immediate(3))
    }

    #[test]
    fn test_system_prompt_lists_tools_and_format() {
        let p = planner(MockLlmClient::new());
        let system = p.build_system(&shop_registry());
        assert!(system.contains("search_shop_catalog"));
        assert!(system.contains("get_order_status"));
        assert!(system.contains(CALL_START));
        assert!(system.contains("\"required\""));
    }

    #[test]
    fn test_model_context_reencodes_calls() {
        let log = vec![
            Message::user("cart?"),
            Message::assistant_with_calls(
                "Checking.",
                vec![ToolInvocation::with_id("call_1", "get_cart", json!({}))],
            ),
            Message::tool("call_1", r#"{"status":"success","result":{}}"#),
        ];
        let ctx = Planner::model_context("sys", &log);
        assert_eq!(ctx.len(), 4);
        assert_eq!(ctx[0].role, Role::System);
        assert_eq!(
            ctx[2].content,
            r#"Checking.<|call|>{"arguments":{},"name":"get_cart"}<|end|>"#
        );
        // 会话日志本身不变
        assert_eq!(log[1].content, "Checking.");
    }

    #[tokio::test]
    async fn test_generate_streams_sanitized_deltas() {
        let mock = MockLlmClient::scripted([
            r#"One moment. <|call|>{"name":"get_cart","arguments":{}}<|end|>"#,
        ])
        .with_chunk_chars(3);
        let p = planner(mock);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let out = p
            .generate(&[Message::user("cart?")], 1024, 0, Some(&tx))
            .await
            .unwrap();
        assert_eq!(out.attempts, 1);
        assert_eq!(out.value.output.text, "One moment.");
        assert_eq!(out.value.output.invocations.len(), 1);
        drop(tx);
        let mut streamed = String::new();
        while let Some(ev) = rx.recv().await {
            if let TurnEvent::TextDelta { text } = ev {
                streamed.push_str(&text);
            }
        }
        assert_eq!(streamed.trim(), "One moment.");
        assert!(!streamed.contains("<|"));
    }

    #[tokio::test]
    async fn test_generate_retries_transient_errors() {
        let mock = MockLlmClient::new();
        mock.push_error(LlmError::RateLimited);
        mock.push_output("Hello!");
        let p = planner(mock);
        let out = p.generate(&[], 1024, 0, None).await.unwrap();
        assert_eq!(out.attempts, 2);
        assert_eq!(out.value.output.text, "Hello!");
        // 失败的尝试没有返回用量
        assert_eq!(out.value.usage, CallUsage::new(10, 1));
    }

    #[tokio::test]
    async fn test_generate_fatal_error_is_not_retried() {
        let mock = MockLlmClient::new();
        mock.push_error(LlmError::Api("bad request".into()));
        mock.push_output("never");
        let p = planner(mock);
        let err = p.generate(&[], 1024, 0, None).await.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(!err.exhausted());
    }
}
