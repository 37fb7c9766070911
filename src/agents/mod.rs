//! Agent 抽象与各专职 Agent
//!
//! 每个 Agent 持有不可变的 AgentConfig（角色、目标、独占 / 共享工具、工作区、预算）与可变的 AgentState。
//! 编排器持有 `AgentId → Arc<dyn Agent>` 注册表，按能力（任务类型）查找，不依赖继承。

pub mod approval;
pub mod architect;
pub mod character;
pub mod coordinator;
pub mod level;
pub mod qa;
pub mod runtime;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentsSection;
use crate::core::context::CoordinatorContext;
use crate::state::AgentState;
use crate::workflow::{AgentId, AgentResult, AgentTask, TaskType};

pub use approval::{ApprovalChannel, ApprovalGate, ApprovalRequest, ChannelApproval};
pub use architect::ArchitectAgent;
pub use character::CharacterAgent;
pub use coordinator::CoordinatorAgent;
pub use level::LevelAgent;
pub use qa::{QaAgent, Severity, ValidationCheck, ValidationIssue};
pub use runtime::AgentRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// 编排 / 分析
    Coordinator,
    /// 场景结构
    Architect,
    /// 角色与资源
    Character,
    /// 关卡与瓦片
    Level,
    /// 质量检查
    Qa,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => "coordinator",
            AgentRole::Architect => "architect",
            AgentRole::Character => "character",
            AgentRole::Level => "level",
            AgentRole::Qa => "qa",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent 的静态配置，构造后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: AgentId,
    pub name: String,
    pub role: AgentRole,
    pub goal: String,
    pub exclusive_tools: Vec<String>,
    pub shared_tools: Vec<String>,
    pub workspace: String,
    pub max_tokens: u64,
    pub max_iterations: u32,
    /// 关键词兜底匹配（仅尽力而为）
    #[serde(skip)]
    pub keywords: Vec<String>,
}

impl AgentConfig {
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>, role: AgentRole, settings: &AgentsSection) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            goal: String::new(),
            exclusive_tools: Vec::new(),
            shared_tools: crate::tools::catalog::to_strings(crate::tools::catalog::SHARED_READ_TOOLS),
            workspace: settings.workspace_root.clone(),
            max_tokens: settings.max_tokens,
            max_iterations: settings.max_iterations.max(1),
            keywords: Vec::new(),
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_exclusive_tools(mut self, tools: &[&str]) -> Self {
        self.exclusive_tools = crate::tools::catalog::to_strings(tools);
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn has_tool_access(&self, tool: &str) -> bool {
        self.exclusive_tools.iter().any(|t| t == tool) || self.shared_tools.iter().any(|t| t == tool)
    }

    pub fn allowed_tools(&self) -> Vec<String> {
        self.exclusive_tools
            .iter()
            .chain(self.shared_tools.iter())
            .cloned()
            .collect()
    }
}

/// 描述中是否包含任一关键词（大小写不敏感）
pub fn keyword_match(keywords: &[String], description: &str) -> bool {
    let text = description.to_lowercase();
    keywords.iter().any(|k| text.contains(&k.to_lowercase()))
}

/// Agent trait：声明能力并执行单个任务
#[async_trait]
pub trait Agent: Send + Sync {
    fn config(&self) -> &AgentConfig;

    /// 明确声明可处理的任务类型（能力表的来源）
    fn handled_task_types(&self) -> &[TaskType];

    fn id(&self) -> &str {
        &self.config().id
    }

    /// 先按任务类型判断；不匹配时按描述关键词兜底。兜底只是启发式，规划时不使用
    fn can_handle(&self, task: &AgentTask) -> bool {
        self.handled_task_types().contains(&task.task_type)
            || keyword_match(&self.config().keywords, &task.description)
    }

    /// 执行一个任务；工具层失败在内部分类处理，不向外抛出
    async fn execute(&self, task: &AgentTask, ctx: &CoordinatorContext) -> AgentResult;

    async fn status(&self) -> AgentState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_access_covers_exclusive_and_shared() {
        let config = AgentConfig::new("architect", "Architect", AgentRole::Architect, &AgentsSection::default())
            .with_exclusive_tools(&["create_scene"]);
        assert!(config.has_tool_access("create_scene"));
        assert!(config.has_tool_access("get_scene_tree"));
        assert!(!config.has_tool_access("paint_terrain"));
        assert_eq!(config.workspace, "res://");
    }

    #[test]
    fn test_keyword_match_is_case_insensitive() {
        let keywords = vec!["Tile".to_string()];
        assert!(keyword_match(&keywords, "paint TILES on the floor"));
        assert!(!keyword_match(&keywords, "add a player"));
    }
}
