//! 推理协作者：接口与 Mock 实现
//!
//! 推理结果只是建议；是否以及如何执行返回的工具调用由 Agent 自行决定（含访问控制）。

pub mod mock;
pub mod traits;

pub use mock::MockReasoningClient;
pub use traits::{LlmError, Observation, ReasoningClient, ReasoningContext, ReasoningResponse};
