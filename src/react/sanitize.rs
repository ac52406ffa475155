//! 追加时清洗（scrub）
//!
//! 上游内容一律不信任：assistant 消息写入会话日志前重新解析一遍，去掉残留标记，
//! 并抹掉文本里与本条消息工具调用等值的 JSON 对象（参数对象，或不带标记的 {name, arguments}）。
//! 等值按解析后的值比较，空白、换行与键顺序不影响。

use serde_json::{Deserializer, Value};

use crate::react::parser::{parse_model_output, CALL_END, CALL_START};
use crate::tools::ToolInvocation;

/// 反复删除协议标记直到不再出现（删除可能拼出新标记）
pub fn strip_markers(text: &str) -> String {
    let mut out = text.to_string();
    while out.contains(CALL_START) || out.contains(CALL_END) {
        out = out.replace(CALL_START, "").replace(CALL_END, "");
    }
    out
}

/// 清洗 assistant 展示内容
pub fn scrub_display_text(content: &str, calls: &[ToolInvocation]) -> String {
    let parsed = parse_model_output(content);
    let text = strip_markers(&parsed.text);
    redact_call_json(&text, calls).trim().to_string()
}

fn is_call_json(value: &Value, calls: &[ToolInvocation]) -> bool {
    calls.iter().any(|call| {
        let non_empty_args = call.arguments.as_object().is_some_and(|o| !o.is_empty());
        (non_empty_args && *value == call.arguments)
            || (value.get("name").and_then(Value::as_str) == Some(call.name.as_str())
                && value.get("arguments") == Some(&call.arguments))
    })
}

/// 从每个 `{` 起尝试读出一个完整 JSON 值；与调用等值的对象整段删除
fn redact_call_json(text: &str, calls: &[ToolInvocation]) -> String {
    if calls.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut copied = 0usize;
    let mut pos = 0usize;
    while let Some(found) = text[pos..].find('{') {
        let start = pos + found;
        let mut values = Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) if value.is_object() && is_call_json(&value, calls) => {
                let end = start + values.byte_offset();
                out.push_str(&text[copied..start]);
                copied = end;
                pos = end;
            }
            _ => pos = start + 1,
        }
    }
    out.push_str(&text[copied..]);
    out
}
