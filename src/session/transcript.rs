//! 客户端可见的对话记录
//!
//! text 永远不含协议标记或工具 JSON；tool 条目只带状态，载荷留在服务端。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::{Message, Role};
use crate::session::Session;
use crate::tools::ToolStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptMessage {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<TranscriptToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_status: Option<ToolStatus>,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptMessage {
    /// system 消息返回 None
    pub(crate) fn from_message(message: &Message, session: &Session) -> Option<Self> {
        match message.role {
            Role::System => None,
            Role::Tool => Some(Self {
                role: Role::Tool,
                text: String::new(),
                tool_calls: Vec::new(),
                tool_call_id: message.tool_call_id.clone(),
                tool_status: message
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| session.tool_result(id))
                    .map(|r| r.status),
                timestamp: message.timestamp,
            }),
            Role::User | Role::Assistant => Some(Self {
                role: message.role,
                text: message.content.clone(),
                tool_calls: message
                    .tool_calls
                    .iter()
                    .map(|c| TranscriptToolCall {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    })
                    .collect(),
                tool_call_id: None,
                tool_status: None,
                timestamp: message.timestamp,
            }),
        }
    }
}
