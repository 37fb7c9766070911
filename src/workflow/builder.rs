//! 计划构建器
//!
//! 提供流畅的API来构建任务计划；build 时分配 Agent、校验依赖并拓扑分层

use serde_json::{Map, Value};

use crate::workflow::graph::TaskGraph;
use crate::workflow::planner::CapabilityTable;
use crate::workflow::types::*;

/// 未显式设置时的任务优先级
pub const DEFAULT_PRIORITY: u8 = 3;

struct TaskDraft {
    id: TaskId,
    task_type: TaskType,
    description: String,
    dependencies: Vec<TaskId>,
    priority: u8,
    input: Map<String, Value>,
    deadline: Option<i64>,
    parent_task_id: Option<TaskId>,
    assigned_agent: Option<AgentId>,
}

/// 计划构建器
pub struct PlanBuilder {
    id: PlanId,
    user_request: String,
    tasks: Vec<TaskDraft>,
}

impl PlanBuilder {
    /// 创建新的计划构建器
    pub fn new(user_request: impl Into<String>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            user_request: user_request.into(),
            tasks: Vec::new(),
        }
    }

    /// 添加任务（创建顺序即同优先级下的调度顺序）
    pub fn task(
        mut self,
        id: impl Into<TaskId>,
        task_type: TaskType,
        description: impl Into<String>,
    ) -> Self {
        self.tasks.push(TaskDraft {
            id: id.into(),
            task_type,
            description: description.into(),
            dependencies: Vec::new(),
            priority: DEFAULT_PRIORITY,
            input: Map::new(),
            deadline: None,
            parent_task_id: None,
            assigned_agent: None,
        });
        self
    }

    fn draft_mut(&mut self, id: &str) -> Option<&mut TaskDraft> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// 设置优先级（1 为最高）
    pub fn priority(mut self, task_id: &str, priority: u8) -> Self {
        if let Some(task) = self.draft_mut(task_id) {
            task.priority = priority.max(1);
        }
        self
    }

    /// 设置依赖（所有前置任务都成功后才可执行）
    pub fn depends_on(mut self, task_id: &str, deps: &[&str]) -> Self {
        if let Some(task) = self.draft_mut(task_id) {
            for dep in deps {
                if !task.dependencies.iter().any(|d| d == dep) {
                    task.dependencies.push(dep.to_string());
                }
            }
        }
        self
    }

    /// 设置顺序依赖：from 完成后执行 to
    pub fn sequential(self, from: &str, to: &str) -> Self {
        self.depends_on(to, &[from])
    }

    /// 设置任务输入
    pub fn input(mut self, task_id: &str, key: impl Into<String>, value: Value) -> Self {
        if let Some(task) = self.draft_mut(task_id) {
            task.input.insert(key.into(), value);
        }
        self
    }

    pub fn deadline(mut self, task_id: &str, deadline_ms: i64) -> Self {
        if let Some(task) = self.draft_mut(task_id) {
            task.deadline = Some(deadline_ms);
        }
        self
    }

    pub fn parent(mut self, task_id: &str, parent_id: impl Into<TaskId>) -> Self {
        if let Some(task) = self.draft_mut(task_id) {
            task.parent_task_id = Some(parent_id.into());
        }
        self
    }

    /// 显式指定执行 Agent（覆盖能力表）
    pub fn assign(mut self, task_id: &str, agent_id: impl Into<AgentId>) -> Self {
        if let Some(task) = self.draft_mut(task_id) {
            task.assigned_agent = Some(agent_id.into());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 构建计划：每个任务必须恰好分配给一个有能力的 Agent，依赖图必须无环
    pub fn build(self, capabilities: &CapabilityTable) -> Result<TaskPlan, PlanError> {
        if self.user_request.trim().is_empty() {
            return Err(PlanError::EmptyRequest);
        }
        if self.tasks.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for draft in self.tasks {
            let assigned_agent = match draft.assigned_agent {
                Some(agent) => agent,
                None => capabilities
                    .agent_for(draft.task_type)
                    .ok_or(PlanError::NoCapableAgent(draft.task_type))?
                    .to_string(),
            };
            tasks.push(AgentTask {
                id: draft.id,
                task_type: draft.task_type,
                description: draft.description,
                assigned_agent,
                dependencies: draft.dependencies,
                priority: draft.priority,
                input: draft.input,
                deadline: draft.deadline,
                parent_task_id: draft.parent_task_id,
            });
        }

        let graph = TaskGraph::new(&tasks)?;
        let parallel_groups = graph.layers()?;
        let dependencies = tasks
            .iter()
            .flat_map(|t| {
                t.dependencies.iter().map(move |d| TaskDependency {
                    task_id: t.id.clone(),
                    depends_on: d.clone(),
                })
            })
            .collect();

        Ok(TaskPlan {
            id: self.id,
            user_request: self.user_request,
            tasks,
            dependencies,
            parallel_groups,
            status: PlanStatus::Created,
            checkpoint_id: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn capabilities() -> CapabilityTable {
        let mut table = CapabilityTable::new();
        table.assign(TaskType::SceneLayout, "architect");
        table.assign(TaskType::Validation, "qa");
        table
    }

    #[test]
    fn test_build_simple_plan() {
        let plan = PlanBuilder::new("build a room")
            .task("layout", TaskType::SceneLayout, "create the room scene")
            .task("check", TaskType::Validation, "validate the room")
            .sequential("layout", "check")
            .priority("layout", 1)
            .input("layout", "path", json!("res://room.tscn"))
            .build(&capabilities())
            .expect("Failed to build plan");

        assert_eq!(plan.status, PlanStatus::Created);
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.task("check").unwrap().assigned_agent, "qa");
        assert_eq!(plan.parallel_groups, vec![vec!["layout"], vec!["check"]]);
        assert_eq!(
            plan.dependencies,
            vec![TaskDependency {
                task_id: "check".into(),
                depends_on: "layout".into()
            }]
        );
        assert!(plan.id.starts_with("plan_"));
    }

    #[test]
    fn test_uncapable_task_fails_whole_plan() {
        let result = PlanBuilder::new("make a level")
            .task("layout", TaskType::SceneLayout, "scene")
            .task("tiles", TaskType::LevelLayout, "tiles")
            .build(&capabilities());
        assert_eq!(result, Err(PlanError::NoCapableAgent(TaskType::LevelLayout)));
    }

    #[test]
    fn test_explicit_assignment_overrides_table() {
        let plan = PlanBuilder::new("tiles")
            .task("tiles", TaskType::LevelLayout, "tiles")
            .assign("tiles", "level")
            .build(&capabilities())
            .unwrap();
        assert_eq!(plan.tasks[0].assigned_agent, "level");
    }

    #[test]
    fn test_build_without_tasks_fails() {
        assert_eq!(
            PlanBuilder::new("x").build(&capabilities()),
            Err(PlanError::EmptyPlan)
        );
        assert_eq!(
            PlanBuilder::new("  ")
                .task("a", TaskType::Validation, "a")
                .build(&capabilities()),
            Err(PlanError::EmptyRequest)
        );
    }
}
