//! 多 Agent 协调原语：资源锁与 Agent 间消息总线

pub mod locks;
pub mod sessions;

pub use locks::{LockManager, DEFAULT_LOCK_TTL_MS, DEFAULT_REAP_INTERVAL};
pub use sessions::{
    AgentInfo, MessageType, SessionMessage, SessionsBus, BROADCAST, DEFAULT_MAX_MESSAGES,
};
