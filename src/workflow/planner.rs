//! TaskPlanner：把请求拆成子目标，分配 Agent，生成分层的 TaskPlan
//!
//! 子目标来源：调用方给出的结构化提示（hints）优先；否则按关键词分解。关键词分解只是近似，
//! 无匹配时退化为单个只读分析任务。任务类型到 Agent 的映射来自显式的能力表，没有对应 Agent
//! 时整个计划失败，不会产生无法派发的任务。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::builder::PlanBuilder;
use crate::workflow::types::*;

/// 一个待规划的子目标；depends_on 引用同一请求中其他子目标的 key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubGoal {
    pub key: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub input: Map<String, Value>,
}

fn default_priority() -> u8 {
    super::builder::DEFAULT_PRIORITY
}

impl SubGoal {
    pub fn new(key: impl Into<String>, task_type: TaskType, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            task_type,
            description: description.into(),
            depends_on: Vec::new(),
            priority: priority_for(task_type),
            input: Map::new(),
        }
    }

    pub fn after(mut self, keys: &[&str]) -> Self {
        self.depends_on.extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }
}

/// 规划输入：请求文本 + 可选结构化提示
#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub user_request: String,
    pub hints: Vec<SubGoal>,
}

impl PlanRequest {
    pub fn new(user_request: impl Into<String>) -> Self {
        Self {
            user_request: user_request.into(),
            hints: Vec::new(),
        }
    }

    pub fn with_hint(mut self, goal: SubGoal) -> Self {
        self.hints.push(goal);
        self
    }
}

impl From<&str> for PlanRequest {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// 任务类型 → Agent 的静态能力表
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: BTreeMap<TaskType, AgentId>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记能力；同一任务类型先登记者生效，返回是否生效
    pub fn assign(&mut self, task_type: TaskType, agent_id: impl Into<AgentId>) -> bool {
        if self.entries.contains_key(&task_type) {
            return false;
        }
        self.entries.insert(task_type, agent_id.into());
        true
    }

    pub fn agent_for(&self, task_type: TaskType) -> Option<&str> {
        self.entries.get(&task_type).map(String::as_str)
    }

    pub fn can_handle(&self, task_type: TaskType) -> bool {
        self.entries.contains_key(&task_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskType, &str)> {
        self.entries.iter().map(|(t, a)| (*t, a.as_str()))
    }
}

const SCENE_KEYWORDS: &[&str] = &["scene", "layout", "room", "menu", "hud", "ui", "node"];
const ASSET_KEYWORDS: &[&str] = &["import", "asset", "texture", "sound", "audio", "font"];
const CHARACTER_KEYWORDS: &[&str] = &["character", "player", "enemy", "npc", "sprite", "animation"];
const LEVEL_KEYWORDS: &[&str] = &["level", "tile", "terrain", "platform", "map", "world"];
const VALIDATION_KEYWORDS: &[&str] = &["test", "verify", "validate", "check", "qa"];

/// 各任务类型的默认优先级（1 为最高）
pub fn priority_for(task_type: TaskType) -> u8 {
    match task_type {
        TaskType::SceneLayout => 1,
        TaskType::AssetImport => 2,
        TaskType::CharacterSetup | TaskType::LevelLayout => 3,
        TaskType::Validation | TaskType::Analysis => 5,
    }
}

fn mentions(text: &str, keywords: &[&str]) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .any(|word| {
            keywords
                .iter()
                .any(|k| word == *k || (k.len() > 3 && word.starts_with(k)))
        })
}

pub struct TaskPlanner {
    capabilities: CapabilityTable,
    append_validation: bool,
}

impl TaskPlanner {
    pub fn new(capabilities: CapabilityTable) -> Self {
        Self {
            capabilities,
            append_validation: true,
        }
    }

    /// 关闭「修改类任务后自动追加质量检查」
    pub fn without_validation(mut self) -> Self {
        self.append_validation = false;
        self
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// 生成计划：结构化提示优先，否则按关键词分解
    pub fn plan(&self, request: &PlanRequest) -> Result<TaskPlan, PlanError> {
        let text = request.user_request.trim();
        if text.is_empty() {
            return Err(PlanError::EmptyRequest);
        }
        let goals = if request.hints.is_empty() {
            self.decompose(text)
        } else {
            request.hints.clone()
        };
        let plan = self.build(text, goals)?;
        tracing::info!(
            plan_id = %plan.id,
            tasks = plan.tasks.len(),
            groups = plan.parallel_groups.len(),
            "Plan created"
        );
        Ok(plan)
    }

    /// 不拆分：整个请求作为一个指定类型的任务
    pub fn single_task_plan(&self, request: &str, task_type: TaskType) -> Result<TaskPlan, PlanError> {
        if request.trim().is_empty() {
            return Err(PlanError::EmptyRequest);
        }
        let goal = SubGoal::new(task_type.as_str(), task_type, request.trim());
        self.build(request.trim(), vec![goal])
    }

    /// 关键词分解
    pub fn decompose(&self, request: &str) -> Vec<SubGoal> {
        let text = request.to_lowercase();
        let scene = mentions(&text, SCENE_KEYWORDS);
        let asset = mentions(&text, ASSET_KEYWORDS);
        let character = mentions(&text, CHARACTER_KEYWORDS);
        let level = mentions(&text, LEVEL_KEYWORDS);
        let validation = mentions(&text, VALIDATION_KEYWORDS);

        let mut goals = Vec::new();
        if scene {
            goals.push(SubGoal::new("scene_layout", TaskType::SceneLayout, format!("Lay out scenes for: {request}")));
        }
        if asset {
            goals.push(SubGoal::new("asset_import", TaskType::AssetImport, format!("Import assets for: {request}")));
        }
        if character {
            let mut goal = SubGoal::new("character_setup", TaskType::CharacterSetup, format!("Set up characters for: {request}"));
            if scene {
                goal = goal.after(&["scene_layout"]);
            }
            if asset {
                goal = goal.after(&["asset_import"]);
            }
            goals.push(goal);
        }
        if level {
            let mut goal = SubGoal::new("level_layout", TaskType::LevelLayout, format!("Build level layout for: {request}"));
            if scene {
                goal = goal.after(&["scene_layout"]);
            }
            goals.push(goal);
        }

        let mutating = !goals.is_empty();
        let wants_validation = validation
            || (mutating && self.append_validation && self.capabilities.can_handle(TaskType::Validation));
        if wants_validation {
            let keys: Vec<String> = goals.iter().map(|g| g.key.clone()).collect();
            let mut goal = SubGoal::new("validation", TaskType::Validation, format!("Validate the result of: {request}"));
            goal.depends_on = keys;
            goals.push(goal);
        }

        if goals.is_empty() {
            goals.push(SubGoal::new("analysis", TaskType::Analysis, request.to_string()));
        }
        goals
    }

    fn build(&self, request: &str, goals: Vec<SubGoal>) -> Result<TaskPlan, PlanError> {
        let ids: BTreeMap<String, String> = goals
            .iter()
            .enumerate()
            .map(|(i, g)| (g.key.clone(), format!("task_{}_{}", i + 1, g.key)))
            .collect();
        // 未知 key 原样保留，由依赖图报告 UnknownDependency
        let id_of = |key: &str| ids.get(key).cloned().unwrap_or_else(|| key.to_string());

        let mut builder = PlanBuilder::new(request);
        for goal in &goals {
            let id = id_of(&goal.key);
            builder = builder
                .task(id.clone(), goal.task_type, goal.description.clone())
                .priority(&id, goal.priority)
                .input(&id, "request", Value::String(request.to_string()));
            for (key, value) in &goal.input {
                builder = builder.input(&id, key.clone(), value.clone());
            }
            let deps: Vec<String> = goal.depends_on.iter().map(|k| id_of(k)).collect();
            let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
            builder = builder.depends_on(&id, &deps);
        }
        builder.build(&self.capabilities)
    }
}
