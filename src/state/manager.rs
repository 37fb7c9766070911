//! 状态管理器：共享项目状态的唯一来源
//!
//! - 读：get_state 返回深拷贝，调用方永远拿不到内部引用
//! - 写：所有修改在同一把写锁内完成（单写者），version 递增并同步广播 StateEvent
//! - 检查点：序列化快照（不含检查点列表）放入环形缓冲，超过上限淘汰最旧的
//! - 回滚：反序列化快照替换实时状态，保留检查点历史；失败只返回 false

use std::collections::BTreeMap;

use tokio::sync::{broadcast, RwLock};

use crate::state::{
    now_ms, AgentState, AssetState, Checkpoint, ConflictInfo, LockInfo, ProjectState, SceneState,
    StateChange, StateEvent, StatePatch,
};
use crate::workflow::{PlanStatus, TaskPlan};

/// 默认保留的检查点数
pub const DEFAULT_MAX_CHECKPOINTS: usize = 50;

pub struct StateManager {
    inner: RwLock<ProjectState>,
    max_checkpoints: usize,
    events: broadcast::Sender<StateEvent>,
}

impl StateManager {
    pub fn new(max_checkpoints: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(ProjectState::default()),
            max_checkpoints: max_checkpoints.max(1),
            events,
        }
    }

    /// 订阅状态变更
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub async fn get_state(&self) -> ProjectState {
        self.inner.read().await.clone()
    }

    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    pub async fn scene(&self, path: &str) -> Option<SceneState> {
        self.inner.read().await.scenes.get(path).cloned()
    }

    pub async fn asset(&self, path: &str) -> Option<AssetState> {
        self.inner.read().await.assets.get(path).cloned()
    }

    pub async fn current_plan(&self) -> Option<TaskPlan> {
        self.inner.read().await.current_plan.clone()
    }

    fn commit(&self, state: &mut ProjectState, change: StateChange) -> u64 {
        state.version += 1;
        let _ = self.events.send(StateEvent {
            version: state.version,
            change,
        });
        state.version
    }

    /// 原子应用补丁；返回新版本号
    pub async fn update_state(&self, patch: StatePatch) -> u64 {
        let mut state = self.inner.write().await;
        for (path, scene) in patch.scenes {
            match scene {
                Some(scene) => {
                    state.scenes.insert(path, scene);
                }
                None => {
                    state.scenes.remove(&path);
                }
            }
        }
        for (path, asset) in patch.assets {
            match asset {
                Some(asset) => {
                    state.assets.insert(path, asset);
                }
                None => {
                    state.assets.remove(&path);
                }
            }
        }
        state.agent_states.extend(patch.agent_states);
        if let Some(plan) = patch.current_plan {
            state.current_plan = plan;
        }
        self.commit(&mut state, StateChange::Patch)
    }

    /// 修改（不存在时先创建）一个场景记录
    pub async fn update_scene_state<F>(&self, path: &str, update: F) -> u64
    where
        F: FnOnce(&mut SceneState),
    {
        let mut state = self.inner.write().await;
        let scene = state
            .scenes
            .entry(path.to_string())
            .or_insert_with(|| SceneState::new(path));
        update(scene);
        scene.modified_at = now_ms();
        self.commit(&mut state, StateChange::Scene(path.to_string()))
    }

    pub async fn remove_scene_state(&self, path: &str) -> u64 {
        let mut state = self.inner.write().await;
        state.scenes.remove(path);
        self.commit(&mut state, StateChange::Scene(path.to_string()))
    }

    /// 修改（不存在时先创建）一个资源记录
    pub async fn update_asset_state<F>(&self, path: &str, update: F) -> u64
    where
        F: FnOnce(&mut AssetState),
    {
        let mut state = self.inner.write().await;
        let asset = state
            .assets
            .entry(path.to_string())
            .or_insert_with(|| AssetState::new(path, "resource"));
        update(asset);
        asset.modified_at = now_ms();
        self.commit(&mut state, StateChange::Asset(path.to_string()))
    }

    pub async fn update_agent_state(&self, agent_id: &str, agent_state: AgentState) -> u64 {
        let mut state = self.inner.write().await;
        state
            .agent_states
            .insert(agent_id.to_string(), agent_state);
        self.commit(&mut state, StateChange::Agent(agent_id.to_string()))
    }

    pub async fn set_current_plan(&self, plan: Option<TaskPlan>) -> u64 {
        let mut state = self.inner.write().await;
        state.current_plan = plan;
        self.commit(&mut state, StateChange::Plan)
    }

    /// 更新当前计划的状态；没有当前计划时返回 false
    pub async fn set_plan_status(&self, status: PlanStatus) -> bool {
        let mut state = self.inner.write().await;
        match state.current_plan.as_mut() {
            Some(plan) => {
                plan.status = status;
                self.commit(&mut state, StateChange::Plan);
                true
            }
            None => false,
        }
    }

    /// 在写锁内修改锁表；闭包返回 (结果, 是否有改动)，有改动才递增版本
    pub async fn modify_locks<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut BTreeMap<String, LockInfo>) -> (R, bool),
    {
        let mut state = self.inner.write().await;
        let (result, changed) = f(&mut state.locks);
        if changed {
            self.commit(&mut state, StateChange::Locks);
        }
        result
    }

    pub async fn locks(&self) -> BTreeMap<String, LockInfo> {
        self.inner.read().await.locks.clone()
    }

    /// 检测其他 Agent 持有的未过期锁；扫描时顺带清除已过期的锁
    pub async fn detect_conflicts(&self, agent_id: &str, resources: &[String]) -> Vec<ConflictInfo> {
        let now = now_ms();
        self.modify_locks(|locks| {
            let mut reaped = false;
            let mut conflicts = Vec::new();
            for path in resources {
                let Some(lock) = locks.get(path) else {
                    continue;
                };
                if lock.is_expired(now) {
                    locks.remove(path);
                    reaped = true;
                    continue;
                }
                if lock.agent_id != agent_id {
                    conflicts.push(ConflictInfo {
                        resource_path: path.clone(),
                        held_by: lock.agent_id.clone(),
                        lock_type: lock.lock_type,
                        operation: lock.operation.clone(),
                        expires_at: lock.expires_at,
                    });
                }
            }
            (conflicts, reaped)
        })
        .await
    }

    /// 创建检查点，返回检查点 ID
    pub async fn create_checkpoint(
        &self,
        label: &str,
        agent_id: Option<&str>,
    ) -> Result<String, serde_json::Error> {
        let mut state = self.inner.write().await;
        let snapshot = serde_json::to_string(&*state)?;
        let id = format!("cp_{}", uuid::Uuid::new_v4());
        state.checkpoints.push(Checkpoint {
            id: id.clone(),
            label: label.to_string(),
            timestamp: now_ms(),
            state_snapshot: snapshot,
            agent_id: agent_id.map(str::to_string),
        });
        let overflow = state.checkpoints.len().saturating_sub(self.max_checkpoints);
        if overflow > 0 {
            state.checkpoints.drain(..overflow);
            tracing::debug!(evicted = overflow, "Evicted oldest checkpoints");
        }
        self.commit(&mut state, StateChange::CheckpointCreated(id.clone()));
        tracing::info!(checkpoint = %id, label, "Checkpoint created");
        Ok(id)
    }

    /// 回滚到指定检查点；ID 未知或快照损坏时返回 false，实时状态保持不变
    pub async fn rollback_to_checkpoint(&self, checkpoint_id: &str) -> bool {
        let mut state = self.inner.write().await;
        let Some(checkpoint) = state.checkpoints.iter().find(|c| c.id == checkpoint_id) else {
            tracing::warn!(checkpoint = %checkpoint_id, "Rollback failed: unknown checkpoint");
            return false;
        };
        let restored: ProjectState = match serde_json::from_str(&checkpoint.state_snapshot) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(checkpoint = %checkpoint_id, "Rollback failed: corrupt snapshot ({})", e);
                return false;
            }
        };
        let label = checkpoint.label.clone();
        let checkpoints = std::mem::take(&mut state.checkpoints);
        let version = state.version.max(restored.version);
        *state = ProjectState {
            version,
            checkpoints,
            ..restored
        };
        self.commit(&mut state, StateChange::RolledBack(checkpoint_id.to_string()));
        tracing::info!(checkpoint = %checkpoint_id, label = %label, "Rolled back to checkpoint");
        true
    }

    /// 最近 limit 个检查点，最新的在最后
    pub async fn get_checkpoint_history(&self, limit: usize) -> Vec<Checkpoint> {
        let state = self.inner.read().await;
        let skip = state.checkpoints.len().saturating_sub(limit);
        state.checkpoints[skip..].to_vec()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHECKPOINTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AgentStatus, LockType};

    fn lock(path: &str, agent: &str, expires_at: i64) -> LockInfo {
        LockInfo {
            resource_path: path.to_string(),
            agent_id: agent.to_string(),
            lock_type: LockType::Exclusive,
            acquired_at: 0,
            expires_at,
            operation: "edit".to_string(),
        }
    }

    #[tokio::test]
    async fn test_get_state_returns_copy() {
        let manager = StateManager::default();
        manager
            .update_scene_state("res://main.tscn", |s| s.root_type = Some("Node2D".into()))
            .await;

        let mut copy = manager.get_state().await;
        copy.scenes.clear();

        assert!(manager.scene("res://main.tscn").await.is_some());
    }

    #[tokio::test]
    async fn test_every_mutation_bumps_version_and_notifies() {
        let manager = StateManager::default();
        let mut rx = manager.subscribe();

        let v1 = manager
            .update_asset_state("res://hero.png", |a| a.asset_type = "texture".into())
            .await;
        let v2 = manager
            .update_agent_state("architect", AgentState::default())
            .await;
        let v3 = manager.update_state(StatePatch::new().remove_scene("res://x.tscn")).await;

        assert_eq!((v1, v2, v3), (1, 2, 3));
        assert_eq!(rx.recv().await.unwrap().change, StateChange::Asset("res://hero.png".into()));
        assert_eq!(rx.recv().await.unwrap().version, 2);
        assert_eq!(rx.recv().await.unwrap().change, StateChange::Patch);
    }

    #[tokio::test]
    async fn test_patch_applies_all_entries() {
        let manager = StateManager::default();
        manager
            .update_state(
                StatePatch::new()
                    .upsert_scene(SceneState::new("res://a.tscn"))
                    .upsert_asset(AssetState::new("res://a.png", "texture"))
                    .agent_state("qa", AgentState::default()),
            )
            .await;
        let state = manager.get_state().await;
        assert_eq!(state.scenes.len(), 1);
        assert_eq!(state.assets.len(), 1);
        assert_eq!(state.agent_states.len(), 1);
        assert_eq!(state.version, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let manager = StateManager::default();
        manager
            .update_asset_state("a", |a| {
                a.metadata.insert("content".into(), serde_json::json!("v1"));
            })
            .await;
        manager
            .modify_locks(|locks| {
                locks.insert("res://a.tscn".into(), lock("res://a.tscn", "architect", i64::MAX));
                ((), true)
            })
            .await;
        let mut agent = AgentState::default();
        agent.status = AgentStatus::Executing;
        manager.update_agent_state("architect", agent).await;

        let before = manager.get_state().await;
        let id = manager.create_checkpoint("before-edit", None).await.unwrap();

        manager
            .update_asset_state("a", |a| {
                a.metadata.insert("content".into(), serde_json::json!("v2"));
            })
            .await;
        manager.modify_locks(|locks| (locks.clear(), true)).await;
        manager.remove_scene_state("res://none.tscn").await;

        assert!(manager.rollback_to_checkpoint(&id).await);
        let after = manager.get_state().await;
        assert_eq!(after.scenes, before.scenes);
        assert_eq!(after.assets, before.assets);
        assert_eq!(after.locks, before.locks);
        assert_eq!(after.agent_states, before.agent_states);
        assert_eq!(after.assets["a"].metadata["content"], "v1");
        assert!(after.version > before.version);
        assert_eq!(after.checkpoints.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_unknown_or_corrupt_returns_false() {
        let manager = StateManager::default();
        assert!(!manager.rollback_to_checkpoint("cp_missing").await);

        let id = manager.create_checkpoint("good", None).await.unwrap();
        manager.update_scene_state("res://keep.tscn", |_| {}).await;
        {
            let mut state = manager.inner.write().await;
            state.checkpoints[0].state_snapshot = "{not json".to_string();
        }
        assert!(!manager.rollback_to_checkpoint(&id).await);
        assert!(manager.scene("res://keep.tscn").await.is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_eviction_keeps_newest() {
        let manager = StateManager::new(50);
        let mut ids = Vec::new();
        for i in 0..60 {
            ids.push(
                manager
                    .create_checkpoint(&format!("cp-{i}"), Some("orchestrator"))
                    .await
                    .unwrap(),
            );
        }
        let history = manager.get_checkpoint_history(50).await;
        assert_eq!(history.len(), 50);
        assert_eq!(history.first().unwrap().label, "cp-10");
        assert_eq!(history.last().unwrap().id, ids[59]);
        assert!(!manager.rollback_to_checkpoint(&ids[0]).await);

        let recent = manager.get_checkpoint_history(3).await;
        assert_eq!(
            recent.iter().map(|c| c.label.as_str()).collect::<Vec<_>>(),
            vec!["cp-57", "cp-58", "cp-59"]
        );
    }

    #[tokio::test]
    async fn test_snapshot_excludes_checkpoints() {
        let manager = StateManager::default();
        manager.create_checkpoint("first", None).await.unwrap();
        manager.create_checkpoint("second", None).await.unwrap();
        let history = manager.get_checkpoint_history(10).await;
        assert!(!history[1].state_snapshot.contains("first"));
    }

    #[tokio::test]
    async fn test_detect_conflicts_reaps_expired() {
        let manager = StateManager::default();
        manager
            .modify_locks(|locks| {
                locks.insert("res://a.tscn".into(), lock("res://a.tscn", "level", i64::MAX));
                locks.insert("res://b.tscn".into(), lock("res://b.tscn", "level", 1));
                locks.insert("res://c.tscn".into(), lock("res://c.tscn", "architect", i64::MAX));
                ((), true)
            })
            .await;

        let conflicts = manager
            .detect_conflicts(
                "architect",
                &[
                    "res://a.tscn".to_string(),
                    "res://b.tscn".to_string(),
                    "res://c.tscn".to_string(),
                ],
            )
            .await;

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resource_path, "res://a.tscn");
        assert_eq!(conflicts[0].held_by, "level");
        assert!(!manager.locks().await.contains_key("res://b.tscn"));
    }

    #[tokio::test]
    async fn test_plan_status_requires_plan() {
        let manager = StateManager::default();
        assert!(!manager.set_plan_status(PlanStatus::Executing).await);
    }
}
