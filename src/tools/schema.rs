//! 工具调用块的 JSON Schema（schemars 生成）
//!
//! 拼入 system prompt，说明 `<|call|>` 与 `<|end|>` 之间应放什么样的 JSON。

use schemars::{schema_for, JsonSchema};
use std::collections::HashMap;

/// 调用块内容：{"name": "...", "arguments": {...}}（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 已登记的工具名，如 search_shop_catalog、get_cart
    pub name: String,
    /// 工具参数对象，省略时视为 {}
    pub arguments: Option<HashMap<String, serde_json::Value>>,
}

/// 返回调用块的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
