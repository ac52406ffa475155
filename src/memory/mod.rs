//! 记忆层：会话消息

pub mod conversation;

pub use conversation::{Message, Role};
