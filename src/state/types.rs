//! 共享项目状态的数据类型
//!
//! ProjectState 只由 StateManager 持有与修改；其他组件拿到的都是克隆。序列化时跳过检查点列表本身，
//! 因此一份快照不会嵌套历史检查点。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::workflow::{AgentId, TaskId, TaskPlan};

/// 场景中的一个节点（parent 为空表示挂在根节点下）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub name: String,
    pub node_type: String,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneState {
    pub path: String,
    #[serde(default)]
    pub root_type: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    /// 场景引用的外部资源路径
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub modified_by: Option<AgentId>,
    pub modified_at: i64,
}

impl SceneState {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            root_type: None,
            nodes: Vec::new(),
            dependencies: Vec::new(),
            modified_by: None,
            modified_at: super::now_ms(),
        }
    }

    pub fn with_root(mut self, root_type: impl Into<String>) -> Self {
        self.root_type = Some(root_type.into());
        self
    }

    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetState {
    pub path: String,
    pub asset_type: String,
    pub revision: u32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub modified_by: Option<AgentId>,
    pub modified_at: i64,
}

impl AssetState {
    pub fn new(path: impl Into<String>, asset_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            asset_type: asset_type.into(),
            revision: 1,
            metadata: serde_json::Map::new(),
            modified_by: None,
            modified_at: super::now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub resource_path: String,
    pub agent_id: AgentId,
    pub lock_type: LockType,
    pub acquired_at: i64,
    pub expires_at: i64,
    pub operation: String,
}

impl LockInfo {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// 两把锁能否共存：任一方为独占即冲突
    pub fn conflicts_with(&self, requested: LockType) -> bool {
        self.lock_type == LockType::Exclusive || requested == LockType::Exclusive
    }
}

/// Agent 状态机：idle → analyzing/executing → (waiting|verifying) → (complete|error) → idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Analyzing,
    Executing,
    Waiting,
    Verifying,
    Complete,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Analyzing => "analyzing",
            AgentStatus::Executing => "executing",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Verifying => "verifying",
            AgentStatus::Complete => "complete",
            AgentStatus::Error => "error",
        }
    }

    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Idle, Analyzing | Executing) => true,
            (Analyzing, Executing | Waiting | Verifying | Complete | Error) => true,
            (Executing, Analyzing | Waiting | Verifying | Complete | Error) => true,
            (Waiting, Analyzing | Executing | Verifying | Error) => true,
            (Verifying, Executing | Complete | Error) => true,
            (Complete | Error, Idle) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub status: AgentStatus,
    #[serde(default)]
    pub current_task: Option<TaskId>,
    pub tokens_used: u64,
    pub last_activity: i64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            status: AgentStatus::Idle,
            current_task: None,
            tokens_used: 0,
            last_activity: super::now_ms(),
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub label: String,
    pub timestamp: i64,
    /// 序列化的 ProjectState（不含检查点列表）
    pub state_snapshot: String,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    pub version: u64,
    #[serde(default)]
    pub scenes: BTreeMap<String, SceneState>,
    #[serde(default)]
    pub assets: BTreeMap<String, AssetState>,
    #[serde(default)]
    pub locks: BTreeMap<String, LockInfo>,
    #[serde(default)]
    pub agent_states: BTreeMap<AgentId, AgentState>,
    #[serde(default)]
    pub current_plan: Option<TaskPlan>,
    #[serde(skip)]
    pub checkpoints: Vec<Checkpoint>,
}

/// 一次原子补丁：map 中 None 表示删除该条目
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub scenes: BTreeMap<String, Option<SceneState>>,
    pub assets: BTreeMap<String, Option<AssetState>>,
    pub agent_states: BTreeMap<AgentId, AgentState>,
    pub current_plan: Option<Option<TaskPlan>>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_scene(mut self, scene: SceneState) -> Self {
        self.scenes.insert(scene.path.clone(), Some(scene));
        self
    }

    pub fn remove_scene(mut self, path: impl Into<String>) -> Self {
        self.scenes.insert(path.into(), None);
        self
    }

    pub fn upsert_asset(mut self, asset: AssetState) -> Self {
        self.assets.insert(asset.path.clone(), Some(asset));
        self
    }

    pub fn remove_asset(mut self, path: impl Into<String>) -> Self {
        self.assets.insert(path.into(), None);
        self
    }

    pub fn agent_state(mut self, agent_id: impl Into<AgentId>, state: AgentState) -> Self {
        self.agent_states.insert(agent_id.into(), state);
        self
    }

    pub fn plan(mut self, plan: Option<TaskPlan>) -> Self {
        self.current_plan = Some(plan);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
            && self.assets.is_empty()
            && self.agent_states.is_empty()
            && self.current_plan.is_none()
    }
}

/// 另一个 Agent 持有的未过期锁
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub resource_path: String,
    pub held_by: AgentId,
    pub lock_type: LockType,
    pub operation: String,
    pub expires_at: i64,
}

/// 状态变更通知（同步广播给订阅者）
#[derive(Debug, Clone, PartialEq)]
pub struct StateEvent {
    pub version: u64,
    pub change: StateChange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Patch,
    Scene(String),
    Asset(String),
    Agent(AgentId),
    Plan,
    Locks,
    CheckpointCreated(String),
    RolledBack(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_conflict_matrix() {
        let held = |lock_type| LockInfo {
            resource_path: "res://a.tscn".into(),
            agent_id: "a1".into(),
            lock_type,
            acquired_at: 0,
            expires_at: 10,
            operation: "edit".into(),
        };
        assert!(held(LockType::Exclusive).conflicts_with(LockType::Shared));
        assert!(held(LockType::Shared).conflicts_with(LockType::Exclusive));
        assert!(!held(LockType::Shared).conflicts_with(LockType::Shared));
        assert!(held(LockType::Shared).is_expired(10));
        assert!(!held(LockType::Shared).is_expired(9));
    }

    #[test]
    fn test_agent_status_transitions() {
        assert!(AgentStatus::Idle.can_transition_to(AgentStatus::Analyzing));
        assert!(AgentStatus::Executing.can_transition_to(AgentStatus::Waiting));
        assert!(AgentStatus::Error.can_transition_to(AgentStatus::Idle));
        assert!(!AgentStatus::Idle.can_transition_to(AgentStatus::Complete));
        assert!(!AgentStatus::Complete.can_transition_to(AgentStatus::Executing));
    }

    #[test]
    fn test_serialized_state_omits_checkpoints() {
        let mut state = ProjectState::default();
        state.checkpoints.push(Checkpoint {
            id: "cp".into(),
            label: "x".into(),
            timestamp: 0,
            state_snapshot: "{}".into(),
            agent_id: None,
        });
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("checkpoints"));
        let back: ProjectState = serde_json::from_str(&json).unwrap();
        assert!(back.checkpoints.is_empty());
    }
}
