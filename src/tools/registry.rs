//! 工具注册表
//!
//! 每个工具登记一份 ToolSchema（名称、描述、参数形状），ToolRegistry 按名查找；
//! 派发前用 validate 做必填与基本类型检查，未登记的名称直接拒绝。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tools::ToolInvocation;

/// 校验失败（对该调用是致命的，不重试）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Arguments for {tool} must be a JSON object")]
    ArgumentsNotObject { tool: String },

    #[error("Missing required argument '{field}' for {tool}")]
    MissingArgument { tool: String, field: String },

    #[error("Argument '{field}' for {tool} must be {expected}")]
    WrongType {
        tool: String,
        field: String,
        expected: &'static str,
    },
}

/// 参数类型（JSON Schema 的基本类型）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Number => "number",
            ParamKind::Integer => "integer",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Number => value.is_number(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
}

/// 单个工具的登记信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    /// 工具描述（供 LLM 理解功能）
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    pub fn required(self, name: &str, kind: ParamKind, description: &str) -> Self {
        self.param(name, kind, true, description)
    }

    pub fn optional(self, name: &str, kind: ParamKind, description: &str) -> Self {
        self.param(name, kind, false, description)
    }

    fn param(mut self, name: &str, kind: ParamKind, required: bool, description: &str) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            kind,
            required,
            description: description.to_string(),
        });
        self
    }

    /// 参数 JSON Schema（写入 system prompt）
    pub fn parameters_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .params
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    serde_json::json!({ "type": p.kind.as_str(), "description": p.description }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// 必填项存在、已声明字段类型正确；未声明的字段放行
    pub fn validate(&self, arguments: &Value) -> Result<(), ToolError> {
        let obj = arguments
            .as_object()
            .ok_or_else(|| ToolError::ArgumentsNotObject {
                tool: self.name.clone(),
            })?;
        for p in &self.params {
            match obj.get(&p.name) {
                None | Some(Value::Null) if p.required => {
                    return Err(ToolError::MissingArgument {
                        tool: self.name.clone(),
                        field: p.name.clone(),
                    })
                }
                None | Some(Value::Null) => {}
                Some(v) if !p.kind.matches(v) => {
                    return Err(ToolError::WrongType {
                        tool: self.name.clone(),
                        field: p.name.clone(),
                        expected: p.kind.as_str(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// 工具注册表：按名称存储 ToolSchema（BTreeMap 保证 prompt 中的顺序稳定）
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSchema>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: ToolSchema) {
        self.tools.insert(schema.name.clone(), schema);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn validate(&self, invocation: &ToolInvocation) -> Result<(), ToolError> {
        self.tools
            .get(&invocation.name)
            .ok_or_else(|| ToolError::UnknownTool(invocation.name.clone()))?
            .validate(&invocation.arguments)
    }

    /// 工具 schema JSON 列表（name / description / parameters）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
