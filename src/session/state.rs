//! 单个会话的状态
//!
//! 消息日志与工具结果日志只追加；归档用它们的下标作为序号，因此同一条记录在多次快照中序号不变。
//! 所有 assistant 消息在追加时清洗，user 消息去掉协议标记。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::{Message, Role};
use crate::react::sanitize::{scrub_display_text, strip_markers};
use crate::session::transcript::TranscriptMessage;
use crate::tools::ToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Closed,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
            SessionStatus::Archived => "archived",
        }
    }
}

/// 每个完成的轮次一条：模型客户端累计计数的增量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub customer_id: Option<String>,
    pub cart_id: Option<String>,
    status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    messages: Vec<Message>,
    tool_results: Vec<ToolResult>,
    usage: Vec<UsageRecord>,
    /// 模型致命失败后置位；日志不截断
    degraded: bool,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            customer_id: None,
            cart_id: None,
            status: SessionStatus::Open,
            created_at: now,
            last_activity: now,
            messages: Vec::new(),
            tool_results: Vec::new(),
            usage: Vec::new(),
            degraded: false,
        }
    }

    pub fn with_customer(mut self, customer_id: Option<String>, cart_id: Option<String>) -> Self {
        self.customer_id = customer_id;
        self.cart_id = cart_id;
        self
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    pub fn close(&mut self) {
        if self.status == SessionStatus::Open {
            self.status = SessionStatus::Closed;
            self.touch();
        }
    }

    /// 归档确认后调用；只有已关闭的会话能被标记
    pub fn mark_archived(&mut self) -> bool {
        if self.status == SessionStatus::Closed {
            self.status = SessionStatus::Archived;
            true
        } else {
            false
        }
    }

    pub fn degraded(&self) -> bool {
        self.degraded
    }

    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn tool_results(&self) -> &[ToolResult] {
        &self.tool_results
    }

    pub fn usage(&self) -> &[UsageRecord] {
        &self.usage
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity
    }

    /// 追加消息；返回其序号
    pub fn push_message(&mut self, mut message: Message) -> usize {
        match message.role {
            Role::Assistant => {
                let scrubbed = scrub_display_text(&message.content, &message.tool_calls);
                if scrubbed != message.content.trim() {
                    tracing::warn!(
                        session_id = %self.id,
                        before_len = message.content.len(),
                        after_len = scrubbed.len(),
                        "scrubbed assistant content before append"
                    );
                }
                message.content = scrubbed;
            }
            Role::User => message.content = strip_markers(&message.content),
            Role::System | Role::Tool => {}
        }
        self.messages.push(message);
        self.touch();
        self.messages.len() - 1
    }

    pub fn push_tool_result(&mut self, result: ToolResult) {
        self.tool_results.push(result);
    }

    pub fn record_usage(&mut self, record: UsageRecord) {
        self.usage.push(record);
    }

    pub fn tool_result(&self, invocation_id: &str) -> Option<&ToolResult> {
        self.tool_results
            .iter()
            .find(|r| r.invocation_id == invocation_id)
    }

    /// 客户端可见记录（不含 system 消息）
    pub fn transcript(&self) -> Vec<TranscriptMessage> {
        self.transcript_from(0)
    }

    /// 从第 start 条消息开始的可见记录
    pub fn transcript_from(&self, start: usize) -> Vec<TranscriptMessage> {
        self.messages
            .iter()
            .skip(start)
            .filter_map(|m| TranscriptMessage::from_message(m, self))
            .collect()
    }
}
