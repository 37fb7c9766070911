//! 场景架构 Agent：创建场景、维护节点树

use async_trait::async_trait;

use crate::config::AgentsSection;
use crate::core::context::CoordinatorContext;
use crate::state::AgentState;
use crate::tools::catalog::ARCHITECT_TOOLS;
use crate::workflow::{AgentResult, AgentTask, TaskType};

use super::{Agent, AgentConfig, AgentRole, AgentRuntime};

pub const ARCHITECT_AGENT_ID: &str = "architect";

pub struct ArchitectAgent {
    runtime: AgentRuntime,
}

impl ArchitectAgent {
    pub fn new(settings: &AgentsSection) -> Self {
        let config = AgentConfig::new(ARCHITECT_AGENT_ID, "Architect", AgentRole::Architect, settings)
            .with_goal("Lay out scenes and keep their node hierarchy consistent")
            .with_exclusive_tools(ARCHITECT_TOOLS)
            .with_keywords(&["scene", "node", "hierarchy", "layout", "menu", "ui"]);
        Self {
            runtime: AgentRuntime::new(config),
        }
    }
}

#[async_trait]
impl Agent for ArchitectAgent {
    fn config(&self) -> &AgentConfig {
        self.runtime.config()
    }

    fn handled_task_types(&self) -> &[TaskType] {
        &[TaskType::SceneLayout]
    }

    async fn execute(&self, task: &AgentTask, ctx: &CoordinatorContext) -> AgentResult {
        self.runtime.run_task(task, ctx).await
    }

    async fn status(&self) -> AgentState {
        self.runtime.status().await
    }
}
