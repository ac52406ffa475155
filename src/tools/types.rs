//! 工具调用与结果的数据类型

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一次工具调用：ID 在同一 assistant 轮内唯一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl ToolInvocation {
    /// 生成新 ID（call_ + uuid 简写）
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
        }
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// 发往外部工具执行服务的请求体：{tool, arguments}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    pub arguments: Value,
}

impl From<&ToolInvocation> for ToolRequest {
    fn from(inv: &ToolInvocation) -> Self {
        Self {
            tool: inv.name.clone(),
            arguments: inv.arguments.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
    /// 瞬时错误重试耗尽且最后原因是超时
    Timeout,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
            ToolStatus::Timeout => "timeout",
        }
    }
}

/// 工具结果：与 ToolInvocation 一一对应，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub invocation_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub status: ToolStatus,
    pub duration_ms: u64,
    /// 实际尝试次数；校验失败为 0
    pub attempts: u32,
    /// 成功时为结果，失败时为 {"error", "message"}
    pub payload: Value,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// 写回会话日志、供模型继续推理的内容
    pub fn to_message_content(&self) -> String {
        let body = match self.status {
            ToolStatus::Success => serde_json::json!({
                "status": self.status.as_str(),
                "result": self.payload,
            }),
            _ => serde_json::json!({
                "status": self.status.as_str(),
                "error": self.payload,
            }),
        };
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invocation_ids_are_unique() {
        let a = ToolInvocation::new("get_cart", json!({}));
        let b = ToolInvocation::new("get_cart", json!({}));
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("call_"));
    }

    #[test]
    fn test_error_result_content() {
        let r = ToolResult {
            invocation_id: "call_1".into(),
            tool_name: "get_cart".into(),
            arguments: json!({}),
            status: ToolStatus::Timeout,
            duration_ms: 5,
            attempts: 3,
            payload: json!({"error": "timeout", "message": "gave up"}),
        };
        let v: Value = serde_json::from_str(&r.to_message_content()).unwrap();
        assert_eq!(v["status"], "timeout");
        assert_eq!(v["error"]["message"], "gave up");
    }
}
