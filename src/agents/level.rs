//! 关卡 Agent：瓦片集、瓦片地图与实体摆放

use async_trait::async_trait;

use crate::config::AgentsSection;
use crate::core::context::CoordinatorContext;
use crate::state::AgentState;
use crate::tools::catalog::LEVEL_TOOLS;
use crate::workflow::{AgentResult, AgentTask, TaskType};

use super::{Agent, AgentConfig, AgentRole, AgentRuntime};

pub const LEVEL_AGENT_ID: &str = "level";

pub struct LevelAgent {
    runtime: AgentRuntime,
}

impl LevelAgent {
    pub fn new(settings: &AgentsSection) -> Self {
        let config = AgentConfig::new(LEVEL_AGENT_ID, "Level Designer", AgentRole::Level, settings)
            .with_goal("Build levels from tiles and place gameplay entities")
            .with_exclusive_tools(LEVEL_TOOLS)
            .with_keywords(&["level", "tile", "tilemap", "terrain", "platform", "map"]);
        Self {
            runtime: AgentRuntime::new(config),
        }
    }
}

#[async_trait]
impl Agent for LevelAgent {
    fn config(&self) -> &AgentConfig {
        self.runtime.config()
    }

    fn handled_task_types(&self) -> &[TaskType] {
        &[TaskType::LevelLayout]
    }

    async fn execute(&self, task: &AgentTask, ctx: &CoordinatorContext) -> AgentResult {
        self.runtime.run_task(task, ctx).await
    }

    async fn status(&self) -> AgentState {
        self.runtime.status().await
    }
}
