//! 角色 Agent：导入素材、配置动画、脚本与碰撞

use async_trait::async_trait;

use crate::config::AgentsSection;
use crate::core::context::CoordinatorContext;
use crate::state::AgentState;
use crate::tools::catalog::CHARACTER_TOOLS;
use crate::workflow::{AgentResult, AgentTask, TaskType};

use super::{Agent, AgentConfig, AgentRole, AgentRuntime};

pub const CHARACTER_AGENT_ID: &str = "character";

pub struct CharacterAgent {
    runtime: AgentRuntime,
}

impl CharacterAgent {
    pub fn new(settings: &AgentsSection) -> Self {
        let config = AgentConfig::new(CHARACTER_AGENT_ID, "Character", AgentRole::Character, settings)
            .with_goal("Set up playable characters and the assets they use")
            .with_exclusive_tools(CHARACTER_TOOLS)
            .with_keywords(&["character", "player", "enemy", "sprite", "animation", "asset", "import"]);
        Self {
            runtime: AgentRuntime::new(config),
        }
    }
}

#[async_trait]
impl Agent for CharacterAgent {
    fn config(&self) -> &AgentConfig {
        self.runtime.config()
    }

    fn handled_task_types(&self) -> &[TaskType] {
        &[TaskType::CharacterSetup, TaskType::AssetImport]
    }

    async fn execute(&self, task: &AgentTask, ctx: &CoordinatorContext) -> AgentResult {
        self.runtime.run_task(task, ctx).await
    }

    async fn status(&self) -> AgentState {
        self.runtime.status().await
    }
}
