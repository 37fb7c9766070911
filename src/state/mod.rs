//! 共享项目状态：类型定义与 StateManager（版本化快照、检查点、回滚）

pub mod manager;
pub mod types;

pub use manager::{StateManager, DEFAULT_MAX_CHECKPOINTS};
pub use types::{
    AgentState, AgentStatus, AssetState, Checkpoint, ConflictInfo, LockInfo, LockType,
    NodeRecord, ProjectState, SceneState, StateChange, StateEvent, StatePatch,
};

/// 当前时间（毫秒时间戳）
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
