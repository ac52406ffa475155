//! 单轮对话过程事件：用于流式/SSE 展示阶段变化、清洗后的文本片段、工具调用与结果

use serde::Serialize;

use crate::tools::ToolStatus;

/// 轮内阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    AwaitingModel,
    Dispatching,
    Finalized,
}

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 阶段切换；round 从 0 计
    Phase { phase: TurnPhase, round: usize },
    /// 清洗后的回复片段（未 trim）
    TextDelta { text: String },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        id: String,
        name: String,
        status: ToolStatus,
        attempts: u32,
        duration_ms: u64,
    },
    /// 工具轮数达到上限，本次请求的调用未派发
    RoundLimit { max_rounds: usize, skipped: usize },
    /// 本轮 token 增量
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    Done,
    Error { text: String },
}
