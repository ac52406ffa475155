//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（非流式）、complete_stream（流式文本片段与用量）。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::core::ErrorClass;
use crate::memory::Message;

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("model request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited")]
    RateLimited,

    /// 请求被拒绝、响应无法解析等不可重试错误
    #[error("api error: {0}")]
    Api(String),
}

impl LlmError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            LlmError::Timeout | LlmError::Network(_) | LlmError::RateLimited => ErrorClass::Transient,
            LlmError::Api(_) => ErrorClass::Fatal,
        }
    }
}

/// 单次模型调用消耗的 token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl CallUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn add(&mut self, other: CallUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

/// 非流式完成的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// 后端未返回用量时为 None
    pub usage: Option<CallUsage>,
}

/// 流式输出项：文本片段，或本次调用的用量（通常在流末尾）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Text(String),
    Usage(CallUsage),
}

/// 模型输出片段流
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// LLM 客户端 trait：非流式完成与流式完成
///
/// 用量随每次调用返回，不从客户端的累计计数推算；客户端被多个会话共享。
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<Completion, LlmError>;

    /// 流式完成；默认把 complete 的结果包成 文本 + 用量 两项
    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError> {
        let completion = self.complete(messages).await?;
        let mut items = vec![Ok(StreamChunk::Text(completion.text))];
        if let Some(usage) = completion.usage {
            items.push(Ok(StreamChunk::Usage(usage)));
        }
        Ok(Box::pin(futures_util::stream::iter(items)))
    }

    /// 写入 usage 表的模型名
    fn model_name(&self) -> &str;
}
