//! 工具层：执行器接口（带超时与审计）、工具目录、模拟编辑器

pub mod catalog;
pub mod executor;
pub mod simulated;

pub use catalog::{StateEffect, ToolAccess, ToolSpec};
pub use executor::{TimedExecutor, ToolCall, ToolExecutor, ToolResult, TIMEOUT_CODE};
pub use simulated::SimulatedEditor;
