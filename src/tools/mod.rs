//! 工具层：调用类型、注册表与校验、外部执行服务、分发器、店铺工具

pub mod dispatcher;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod shop;
pub mod types;

pub use dispatcher::ToolDispatcher;
pub use executor::{HttpToolExecutor, ExecutorError, ToolExecutor};
pub use registry::{ParamKind, ParamSpec, ToolError, ToolRegistry, ToolSchema};
pub use schema::tool_call_schema_json;
pub use shop::{decode_payload, shop_registry, ShopOutput};
pub use types::{ToolInvocation, ToolRequest, ToolResult, ToolStatus};
