//! Mock 推理客户端（用于测试与演示，无需 API）
//!
//! 第一轮返回任务输入中的 `tool_calls`（没有时使用按任务类型登记的脚本），之后的轮次不再建议调用。

use std::collections::HashMap;

use async_trait::async_trait;

use crate::llm::{LlmError, ReasoningClient, ReasoningContext, ReasoningResponse};
use crate::tools::ToolCall;
use crate::workflow::TaskType;

#[derive(Debug, Default)]
pub struct MockReasoningClient {
    scripts: HashMap<TaskType, Vec<ToolCall>>,
}

impl MockReasoningClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为某类任务登记默认调用脚本
    pub fn with_script(mut self, task_type: TaskType, calls: Vec<ToolCall>) -> Self {
        self.scripts.insert(task_type, calls);
        self
    }
}

#[async_trait]
impl ReasoningClient for MockReasoningClient {
    async fn send(
        &self,
        context: &ReasoningContext,
        _image_data: Option<&[u8]>,
    ) -> Result<ReasoningResponse, LlmError> {
        let tokens_used = (context.task.description.len() / 4) as u64 + 1;
        if context.iteration > 0 {
            return Ok(ReasoningResponse {
                text: format!("Done: {}", context.task.description),
                tool_calls: Vec::new(),
                tokens_used,
            });
        }

        let tool_calls = match context.task.input.get("tool_calls") {
            Some(raw) => serde_json::from_value::<Vec<ToolCall>>(raw.clone())
                .map_err(|e| LlmError::InvalidResponse(e.to_string()))?,
            None => self
                .scripts
                .get(&context.task.task_type)
                .cloned()
                .unwrap_or_default(),
        };
        Ok(ReasoningResponse {
            text: format!("Plan for {}: {} call(s)", context.task.id, tool_calls.len()),
            tool_calls,
            tokens_used,
        })
    }
}
