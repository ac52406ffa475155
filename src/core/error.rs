//! 聊天层错误类型
//!
//! 只有致命、不可恢复的情况才会越过组件边界：解析诊断与工具校验失败都在组件内转成数据。

use thiserror::Error;

use crate::llm::LlmError;

/// 越过 ChatService 边界的错误
#[derive(Error, Debug)]
pub enum ChatError {
    /// 模型调用失败（已按重试策略重试）；会话被标记为 degraded，日志保持完整
    #[error("Model call failed after {attempts} attempt(s): {source}")]
    Model {
        #[source]
        source: LlmError,
        attempts: u32,
    },

    #[error("Session is closed: {0}")]
    SessionClosed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 客户端断开或显式取消；已派发的工具结果仍写入会话日志
    #[error("Turn cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),

    /// 构建期缺少必需能力（模型客户端、工具执行服务等）
    #[error("Missing capability: {0}")]
    MissingCapability(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for ChatError {
    fn from(e: config::ConfigError) -> Self {
        ChatError::ConfigError(e.to_string())
    }
}
