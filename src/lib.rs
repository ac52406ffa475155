//! storechat - 店铺聊天助手的工具调用中介层
//!
//! 模块划分：
//! - **agent**: 组件构建与无头 ChatService（供 REPL / HTTP 调用）
//! - **archive**: 会话快照的异步、幂等 SQLite 归档
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、重试退避、工具并发、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话消息
//! - **react**: 协议解析、清洗、Planner 与单轮工具调用循环
//! - **session**: 会话状态、客户端可见记录、注册表
//! - **tools**: 工具注册表与校验、外部执行服务、分发器

pub mod agent;
pub mod archive;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
#[cfg(feature = "web")]
pub mod server;
pub mod session;
pub mod tools;

pub use agent::{AgentComponents, AgentComponentsBuilder, ChatRequest, ChatService};
pub use core::ChatError;
