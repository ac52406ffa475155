//! 归档快照：会话的持久化投影
//!
//! 每行以 (session_id, seq) 为键，seq 是该条目在会话追加日志中的下标，跨快照稳定。

use chrono::{DateTime, Utc};

use crate::session::{Session, SessionStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedMessage {
    pub seq: i64,
    pub role: &'static str,
    pub content: String,
    /// 无调用时为 None
    pub tool_calls_json: Option<String>,
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedToolCall {
    pub seq: i64,
    pub invocation_id: String,
    pub tool_name: String,
    pub arguments_json: String,
    pub result_json: String,
    pub status: &'static str,
    pub attempts: i64,
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedUsage {
    pub seq: i64,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRecord {
    pub session_id: String,
    pub customer_id: Option<String>,
    pub cart_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub degraded: bool,
    pub messages: Vec<ArchivedMessage>,
    pub tool_calls: Vec<ArchivedToolCall>,
    pub usage: Vec<ArchivedUsage>,
}

impl ArchiveRecord {
    pub fn from_session(session: &Session) -> Self {
        let messages = session
            .messages()
            .iter()
            .enumerate()
            .map(|(seq, m)| ArchivedMessage {
                seq: seq as i64,
                role: m.role.as_str(),
                content: m.content.clone(),
                tool_calls_json: if m.tool_calls.is_empty() {
                    None
                } else {
                    serde_json::to_string(&m.tool_calls).ok()
                },
                tool_call_id: m.tool_call_id.clone(),
                timestamp: m.timestamp,
            })
            .collect();

        let tool_calls = session
            .tool_results()
            .iter()
            .enumerate()
            .map(|(seq, r)| {
                // 结果的时间取对应 tool 消息的时间
                let timestamp = session
                    .messages()
                    .iter()
                    .find(|m| m.tool_call_id.as_deref() == Some(r.invocation_id.as_str()))
                    .map(|m| m.timestamp)
                    .unwrap_or(session.last_activity);
                ArchivedToolCall {
                    seq: seq as i64,
                    invocation_id: r.invocation_id.clone(),
                    tool_name: r.tool_name.clone(),
                    arguments_json: r.arguments.to_string(),
                    result_json: r.payload.to_string(),
                    status: r.status.as_str(),
                    attempts: r.attempts as i64,
                    duration_ms: r.duration_ms as i64,
                    timestamp,
                }
            })
            .collect();

        let usage = session
            .usage()
            .iter()
            .enumerate()
            .map(|(seq, u)| ArchivedUsage {
                seq: seq as i64,
                model: u.model.clone(),
                prompt_tokens: u.prompt_tokens as i64,
                completion_tokens: u.completion_tokens as i64,
                timestamp: u.timestamp,
            })
            .collect();

        Self {
            session_id: session.id.clone(),
            customer_id: session.customer_id.clone(),
            cart_id: session.cart_id.clone(),
            status: session.status(),
            created_at: session.created_at,
            last_activity: session.last_activity,
            degraded: session.degraded(),
            messages,
            tool_calls,
            usage,
        }
    }

    /// 已关闭会话的快照是最后一份
    pub fn is_final(&self) -> bool {
        self.status != SessionStatus::Open
    }

    /// 写入存储的状态：最后一份快照落盘即视为已归档
    pub fn durable_status(&self) -> &'static str {
        if self.is_final() {
            SessionStatus::Archived.as_str()
        } else {
            SessionStatus::Open.as_str()
        }
    }
}
