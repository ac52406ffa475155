//! 会话：状态、客户端可见的对话记录与注册表

pub mod registry;
pub mod state;
pub mod transcript;

pub use registry::SessionRegistry;
pub use state::{Session, SessionStatus, UsageRecord};
pub use transcript::{TranscriptMessage, TranscriptToolCall};
