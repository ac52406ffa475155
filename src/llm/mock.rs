//! Mock LLM 客户端（用于测试与本地 REPL，无需 API）
//!
//! 按脚本依次返回预设输出；脚本耗尽后回显最后一条 User 消息。流式输出按固定字符数切片，
//! 便于覆盖跨片段的协议标记。每次调用计 10 个 prompt token，completion token 为输出的词数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{CallUsage, Completion, LlmClient, LlmError, StreamChunk, TokenStream};
use crate::memory::{Message, Role};

/// 脚本化 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    /// 流式切片大小；0 表示整段输出
    chunk_chars: usize,
    /// 每次调用前的等待，模拟慢模型
    latency: Duration,
    calls: AtomicUsize,
    /// 每次调用看到的消息（用于断言模型上下文）
    seen: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回给定输出
    pub fn scripted<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        for o in outputs {
            mock.push_output(o);
        }
        mock
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push_output(&self, output: impl Into<String>) {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(Ok(output.into()));
        }
    }

    pub fn push_error(&self, err: LlmError) {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(Err(err));
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 第 n 次调用时传入的消息
    pub fn seen_messages(&self, call: usize) -> Option<Vec<Message>> {
        self.seen.lock().ok().and_then(|s| s.get(call).cloned())
    }

    fn next_output(&self, messages: &[Message]) -> Result<(String, CallUsage), LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let output = match scripted {
            Some(o) => o?,
            None => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                format!("Echo from Mock: {}", last_user)
            }
        };
        let usage = CallUsage::new(10, output.split_whitespace().count() as u64);
        Ok((output, usage))
    }

    async fn wait(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<Completion, LlmError> {
        self.wait().await;
        let (text, usage) = self.next_output(messages)?;
        Ok(Completion {
            text,
            usage: Some(usage),
        })
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError> {
        self.wait().await;
        let (content, usage) = self.next_output(messages)?;
        let mut chunks: Vec<Result<StreamChunk, LlmError>> = if self.chunk_chars == 0 {
            vec![Ok(StreamChunk::Text(content))]
        } else {
            let chars: Vec<char> = content.chars().collect();
            chars
                .chunks(self.chunk_chars)
                .map(|c| Ok(StreamChunk::Text(c.iter().collect())))
                .collect()
        };
        chunks.push(Ok(StreamChunk::Usage(usage)));
        Ok(Box::pin(stream::iter(chunks)))
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_script_then_echo() {
        let mock = MockLlmClient::scripted(["first"]);
        let msgs = vec![Message::user("hello")];
        assert_eq!(mock.complete(&msgs).await.unwrap().text, "first");
        let echo = mock.complete(&msgs).await.unwrap();
        assert_eq!(echo.text, "Echo from Mock: hello");
        assert_eq!(echo.usage, Some(CallUsage::new(10, 4)));
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_stream_is_chunked() {
        let mock = MockLlmClient::scripted(["abcdefg"]).with_chunk_chars(3);
        let parts: Vec<StreamChunk> = mock
            .complete_stream(&[])
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(
            parts,
            vec![
                StreamChunk::Text("abc".into()),
                StreamChunk::Text("def".into()),
                StreamChunk::Text("g".into()),
                StreamChunk::Usage(CallUsage::new(10, 1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_scripted_error_is_returned() {
        let mock = MockLlmClient::new();
        mock.push_error(LlmError::Timeout);
        assert_eq!(mock.complete(&[]).await.unwrap_err(), LlmError::Timeout);
    }
}
