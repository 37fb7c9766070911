//! 任务计划类型定义
//!
//! 定义任务、任务结果、依赖关系与计划等核心数据类型

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::error::AgentError;

pub type PlanId = String;
pub type TaskId = String;
pub type AgentId = String;

/// 任务类型（决定由哪一类 Agent 处理）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// 场景结构搭建
    SceneLayout,
    /// 角色设置
    CharacterSetup,
    /// 资源导入
    AssetImport,
    /// 关卡 / 瓦片布局
    LevelLayout,
    /// 质量检查
    Validation,
    /// 只读分析
    Analysis,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::SceneLayout,
        TaskType::CharacterSetup,
        TaskType::AssetImport,
        TaskType::LevelLayout,
        TaskType::Validation,
        TaskType::Analysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SceneLayout => "scene_layout",
            TaskType::CharacterSetup => "character_setup",
            TaskType::AssetImport => "asset_import",
            TaskType::LevelLayout => "level_layout",
            TaskType::Validation => "validation",
            TaskType::Analysis => "analysis",
        }
    }

    /// 该类任务是否会修改项目
    pub fn is_mutating(&self) -> bool {
        !matches!(self, TaskType::Validation | TaskType::Analysis)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 计划中的一个任务，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub description: String,
    pub assigned_agent: AgentId,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// 1 为最高优先级
    pub priority: u8,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
}

/// 一次任务尝试的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub success: bool,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
    pub tokens_used: u64,
    pub execution_time_ms: u64,
}

impl AgentResult {
    pub fn success(task_id: impl Into<TaskId>, agent_id: impl Into<AgentId>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            success: true,
            artifacts: Vec::new(),
            output: Map::new(),
            error: None,
            tokens_used: 0,
            execution_time_ms: 0,
        }
    }

    pub fn failure(
        task_id: impl Into<TaskId>,
        agent_id: impl Into<AgentId>,
        error: AgentError,
    ) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::success(task_id, agent_id)
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.output.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDependency {
    pub task_id: TaskId,
    pub depends_on: TaskId,
}

/// 计划状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// 已创建，等待执行
    Created,
    /// 正在执行
    Executing,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 执行失败
    Failed,
    /// 已回滚
    RolledBack,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::RolledBack
        )
    }
}

/// 已校验、可调度的任务计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPlan {
    pub id: PlanId,
    pub user_request: String,
    pub tasks: Vec<AgentTask>,
    pub dependencies: Vec<TaskDependency>,
    /// 拓扑分层：每组内部无依赖，只依赖更早的组；组内按优先级、再按创建顺序排列
    pub parallel_groups: Vec<Vec<TaskId>>,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    pub created_at: i64,
}

impl TaskPlan {
    pub fn task(&self, id: &str) -> Option<&AgentTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            plan_id: self.id.clone(),
            user_request: self.user_request.clone(),
            task_count: self.tasks.len(),
            groups: self
                .parallel_groups
                .iter()
                .map(|group| {
                    group
                        .iter()
                        .filter_map(|id| self.task(id))
                        .map(|t| format!("{} ({} → {})", t.id, t.task_type, t.assigned_agent))
                        .collect()
                })
                .collect(),
        }
    }
}

/// 计划摘要（用于进度通知）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub plan_id: PlanId,
    pub user_request: String,
    pub task_count: usize,
    pub groups: Vec<Vec<String>>,
}

/// 规划错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Empty request")]
    EmptyRequest,
    #[error("Plan contains no tasks")]
    EmptyPlan,
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),
    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },
    #[error("Cyclic dependency detected among: {0:?}")]
    CyclicDependency(Vec<TaskId>),
    #[error("No agent can handle task type {0}")]
    NoCapableAgent(TaskType),
}
