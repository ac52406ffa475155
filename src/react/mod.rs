//! 对话层：协议解析、追加时清洗、Planner 与单轮工具调用循环

pub mod events;
pub mod loop_;
pub mod parser;
pub mod planner;
pub mod sanitize;

pub use events::{TurnEvent, TurnPhase};
pub use loop_::{run_turn, TurnContext, TurnOutcome, DEFAULT_MAX_TOOL_ROUNDS};
pub use parser::{
    parse_model_output, ParseDiagnostic, ParseOutput, ParsedCall, ToolCallParser, CALL_END,
    CALL_START,
};
pub use planner::{Generation, Planner, DEFAULT_SYSTEM_PROMPT};
pub use sanitize::{scrub_display_text, strip_markers};
