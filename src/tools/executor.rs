//! 外部工具执行服务
//!
//! ToolExecutor 是注入的能力接口：一次请求 {tool, arguments}，返回成功载荷或 ExecutorError。
//! HttpToolExecutor 通过 reqwest 把请求 POST 到配置的端点；服务信任上游已建立的调用方身份，不带令牌。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::ErrorClass;
use crate::tools::ToolRequest;

/// 工具执行服务返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("network error: {0}")]
    Network(String),

    #[error("tool call timed out")]
    Timeout,

    /// 5xx / 429 等服务端瞬时错误
    #[error("service error {status}: {message}")]
    Server { status: u16, message: String },

    /// 4xx 或结构化的参数拒绝
    #[error("rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("undecodable response: {0}")]
    Decode(String),
}

impl ExecutorError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            ExecutorError::Network(_) | ExecutorError::Timeout | ExecutorError::Server { .. } => {
                ErrorClass::Transient
            }
            ExecutorError::Rejected { .. }
            | ExecutorError::UnknownTool(_)
            | ExecutorError::Decode(_) => ErrorClass::Fatal,
        }
    }

    /// 写入 ToolResult 的错误载荷
    pub fn to_payload(&self) -> Value {
        let kind = match self {
            ExecutorError::Network(_) => "network",
            ExecutorError::Timeout => "timeout",
            ExecutorError::Server { .. } => "server",
            ExecutorError::Rejected { .. } => "rejected",
            ExecutorError::UnknownTool(_) => "unknown_tool",
            ExecutorError::Decode(_) => "decode",
        };
        serde_json::json!({ "error": kind, "message": self.to_string() })
    }
}

/// 外部工具执行服务接口
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, request: &ToolRequest) -> Result<Value, ExecutorError>;
}

/// HTTP 实现：POST {endpoint} body = {tool, arguments}
pub struct HttpToolExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpToolExecutor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecutorError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(&self, request: &ToolRequest) -> Result<Value, ExecutorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutorError::Timeout
                } else {
                    ExecutorError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Timeout
            } else {
                ExecutorError::Network(e.to_string())
            }
        })?;
        interpret_response(status, &text)
    }
}

/// 按 HTTP 状态与响应体判定成功 / 错误；2xx 响应体里的 {status, message} 也视为结构化错误
pub fn interpret_response(status: u16, body: &str) -> Result<Value, ExecutorError> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    if !(200..300).contains(&status) {
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.chars().take(200).collect());
        return Err(match status {
            404 if message.to_lowercase().contains("unknown tool") => {
                ExecutorError::UnknownTool(message)
            }
            429 | 500..=599 => ExecutorError::Server { status, message },
            _ => ExecutorError::Rejected { status, message },
        });
    }

    let value = match parsed {
        Some(v) => v,
        None if body.trim().is_empty() => {
            return Err(ExecutorError::Decode("empty response body".to_string()))
        }
        // 纯文本载荷（如政策答案）按字符串保留
        None => Value::String(body.to_string()),
    };
    if let Some(err) = structured_error(&value) {
        return Err(err);
    }
    Ok(value)
}

fn structured_error(value: &Value) -> Option<ExecutorError> {
    let obj = value.as_object()?;
    let message = obj.get("message")?.as_str()?.to_string();
    match obj.get("status")? {
        Value::String(s) if s.eq_ignore_ascii_case("error") => {
            Some(ExecutorError::Rejected { status: 400, message })
        }
        Value::Number(n) => {
            let code = n.as_u64()? as u16;
            match code {
                500..=599 => Some(ExecutorError::Server { status: code, message }),
                400..=499 => Some(ExecutorError::Rejected { status: code, message }),
                _ => None,
            }
        }
        _ => None,
    }
}
