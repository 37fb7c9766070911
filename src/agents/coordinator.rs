//! 编排 Agent：处理只读分析任务，也是单 Agent 模式下的唯一执行者

use async_trait::async_trait;

use crate::config::AgentsSection;
use crate::core::context::CoordinatorContext;
use crate::state::AgentState;
use crate::workflow::{AgentResult, AgentTask, TaskType};

use super::{Agent, AgentConfig, AgentRole, AgentRuntime};

pub const COORDINATOR_AGENT_ID: &str = "coordinator";

/// 只持有共享只读工具
pub struct CoordinatorAgent {
    runtime: AgentRuntime,
}

impl CoordinatorAgent {
    pub fn new(settings: &AgentsSection) -> Self {
        let config = AgentConfig::new(COORDINATOR_AGENT_ID, "Coordinator", AgentRole::Coordinator, settings)
            .with_goal("Understand the project and answer questions about its current structure")
            .with_keywords(&["analyze", "inspect", "explain", "describe", "list"]);
        Self {
            runtime: AgentRuntime::new(config),
        }
    }
}

#[async_trait]
impl Agent for CoordinatorAgent {
    fn config(&self) -> &AgentConfig {
        self.runtime.config()
    }

    fn handled_task_types(&self) -> &[TaskType] {
        &[TaskType::Analysis]
    }

    async fn execute(&self, task: &AgentTask, ctx: &CoordinatorContext) -> AgentResult {
        self.runtime.run_task(task, ctx).await
    }

    async fn status(&self) -> AgentState {
        self.runtime.status().await
    }
}
