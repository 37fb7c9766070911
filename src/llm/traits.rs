//! 推理客户端抽象
//!
//! send 接收 Agent 组装的上下文（可附带图像数据），返回文本与建议的工具调用。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::AgentRole;
use crate::tools::ToolCall;
use crate::workflow::AgentTask;

/// 上一次工具调用的观察结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub tool: String,
    pub success: bool,
    pub summary: String,
}

/// 发给推理协作者的上下文
#[derive(Debug, Clone)]
pub struct ReasoningContext {
    pub agent_id: String,
    pub role: AgentRole,
    pub goal: String,
    pub task: AgentTask,
    /// 该 Agent 可用的工具（独占 + 共享）
    pub allowed_tools: Vec<String>,
    /// 从 0 开始的迭代序号
    pub iteration: u32,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningResponse {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tokens_used: u64,
}

impl ReasoningResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// 没有工具调用即视为本轮结束
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// 推理协作者错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// 推理客户端 trait
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn send(
        &self,
        context: &ReasoningContext,
        image_data: Option<&[u8]>,
    ) -> Result<ReasoningResponse, LlmError>;
}
