//! 协调上下文：启动时构造一次，以引用传给所有组件（替代全局单例）

use std::sync::Arc;
use std::time::Duration;

use crate::agents::{ApprovalChannel, ApprovalGate};
use crate::config::AppConfig;
use crate::coordination::{LockManager, SessionsBus};
use crate::core::error_log::ErrorLogger;
use crate::core::events::EventSink;
use crate::core::phase::PhaseTracker;
use crate::core::recovery::{ErrorClassifier, RecoveryPlanner};
use crate::llm::ReasoningClient;
use crate::state::StateManager;
use crate::tools::{TimedExecutor, ToolExecutor};

/// Agent 执行时使用的参数
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub lock_ttl_ms: u64,
    pub lock_retries: u32,
    pub lock_retry_delay: Duration,
    /// 破坏性操作前是否自动建检查点
    pub enable_checkpoints: bool,
    pub failure_loop_threshold: usize,
}

impl ExecutionSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            lock_ttl_ms: cfg.coordinator.lock_timeout_ms,
            lock_retries: cfg.locks.acquire_retries,
            lock_retry_delay: cfg.locks.retry_delay(),
            enable_checkpoints: cfg.coordinator.enable_checkpoints,
            failure_loop_threshold: cfg.recovery.failure_loop_threshold,
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

pub struct CoordinatorContext {
    pub state: Arc<StateManager>,
    pub locks: Arc<LockManager>,
    pub sessions: Arc<SessionsBus>,
    pub tools: TimedExecutor,
    pub reasoning: Arc<dyn ReasoningClient>,
    pub classifier: ErrorClassifier,
    pub recovery: RecoveryPlanner,
    pub error_log: ErrorLogger,
    pub approvals: ApprovalGate,
    pub events: EventSink,
    pub phase: PhaseTracker,
    pub settings: ExecutionSettings,
}

impl CoordinatorContext {
    /// 按配置组装全部共享组件
    pub fn new(
        cfg: &AppConfig,
        tools: Arc<dyn ToolExecutor>,
        reasoning: Arc<dyn ReasoningClient>,
        approval_channel: Option<Arc<dyn ApprovalChannel>>,
        events: EventSink,
    ) -> Self {
        let state = Arc::new(StateManager::new(cfg.coordinator.max_checkpoints));
        let locks = Arc::new(LockManager::new(state.clone(), cfg.coordinator.lock_timeout_ms));
        Self {
            state,
            locks,
            sessions: Arc::new(SessionsBus::new(cfg.sessions.max_messages)),
            tools: TimedExecutor::new(tools, cfg.tools.tool_timeout_ms),
            reasoning,
            classifier: ErrorClassifier::new(),
            recovery: RecoveryPlanner::new(),
            error_log: ErrorLogger::new(cfg.recovery.error_log_capacity),
            approvals: ApprovalGate::new(
                approval_channel,
                Duration::from_secs(cfg.approval.timeout_secs),
                cfg.approval.default_on_timeout,
            ),
            events,
            phase: PhaseTracker::new(),
            settings: ExecutionSettings::from_config(cfg),
        }
    }
}
