//! 任务依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑分层（Kahn 算法，逐层剥离入度为 0 的任务）

use std::collections::{HashMap, HashSet};

use crate::workflow::types::*;

/// 任务依赖图
pub struct TaskGraph {
    /// 邻接表：任务 ID -> 依赖该任务的任务列表
    pub adjacency: HashMap<TaskId, Vec<TaskId>>,
    /// 入度表：任务 ID -> 依赖数
    pub in_degree: HashMap<TaskId, usize>,
    dependencies: HashMap<TaskId, Vec<TaskId>>,
    /// 层内排序键：(优先级, 创建顺序)
    order: HashMap<TaskId, (u8, usize)>,
}

impl TaskGraph {
    /// 创建依赖图，校验任务 ID 唯一且所有依赖都存在
    pub fn new(tasks: &[AgentTask]) -> Result<Self, PlanError> {
        let mut adjacency: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut in_degree: HashMap<TaskId, usize> = HashMap::new();
        let mut dependencies: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut order = HashMap::new();

        for (index, task) in tasks.iter().enumerate() {
            if order.insert(task.id.clone(), (task.priority, index)).is_some() {
                return Err(PlanError::DuplicateTask(task.id.clone()));
            }
            in_degree.insert(task.id.clone(), 0);
            adjacency.insert(task.id.clone(), Vec::new());
        }

        for task in tasks {
            let mut seen = HashSet::new();
            for dep_id in &task.dependencies {
                if !order.contains_key(dep_id) {
                    return Err(PlanError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep_id.clone(),
                    });
                }
                if !seen.insert(dep_id) {
                    continue;
                }
                adjacency.entry(dep_id.clone()).or_default().push(task.id.clone());
                *in_degree.entry(task.id.clone()).or_insert(0) += 1;
            }
            dependencies.insert(task.id.clone(), seen.into_iter().cloned().collect());
        }

        Ok(Self {
            adjacency,
            in_degree,
            dependencies,
            order,
        })
    }

    /// 拓扑分层：每层包含依赖全部落在更早层中的任务，层内按优先级升序、再按创建顺序
    pub fn layers(&self) -> Result<Vec<Vec<TaskId>>, PlanError> {
        let mut degree = self.in_degree.clone();
        let mut current: Vec<TaskId> = degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut layers = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            current.sort_by_key(|id| self.order[id]);
            let mut next = Vec::new();
            for task_id in &current {
                for dependent in &self.adjacency[task_id] {
                    if let Some(d) = degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            next.push(dependent.clone());
                        }
                    }
                }
            }
            placed += current.len();
            layers.push(current);
            current = next;
        }

        if placed < self.order.len() {
            let mut stuck: Vec<TaskId> = degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id)
                .collect();
            stuck.sort_by_key(|id| self.order[id]);
            return Err(PlanError::CyclicDependency(stuck));
        }

        Ok(layers)
    }

    /// 获取可执行的任务（依赖全部成功完成、自身尚未完成），按优先级与创建顺序排列
    pub fn get_ready_tasks(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .dependencies
            .iter()
            .filter(|(id, deps)| !completed.contains(*id) && deps.iter().all(|d| completed.contains(d)))
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort_by_key(|id| self.order[id]);
        ready
    }

    /// 某任务的依赖是否都已满足
    pub fn dependencies_met(&self, task_id: &str, completed: &HashSet<TaskId>) -> bool {
        self.dependencies
            .get(task_id)
            .map_or(false, |deps| deps.iter().all(|d| completed.contains(d)))
    }
}
