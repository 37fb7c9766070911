//! 编排过程事件：进度、Agent 状态、计划创建、多 Agent 开关
//!
//! 通过无界通道投递，发送方从不等待接收方；接收方缺席或关闭时事件被丢弃。

use serde::Serialize;
use tokio::sync::mpsc;

use crate::agents::AgentRole;
use crate::state::AgentStatus;
use crate::workflow::PlanSummary;

/// 可序列化为 JSON 供前端展示
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    /// 进度文本
    Progress { message: String },
    /// Agent 状态变化；progress 为 0.0 ~ 1.0
    AgentStatus {
        name: String,
        role: AgentRole,
        state: AgentStatus,
        progress: f32,
    },
    /// 计划已创建
    PlanCreated(PlanSummary),
    /// 是否启用多 Agent 拆分
    MultiAgentEnabled { enabled: bool },
    /// 工具失败后的恢复动作
    Recovery {
        agent: String,
        tool: String,
        action: String,
        detail: String,
    },
}

/// 事件出口（fire-and-forget）
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<CoordinatorEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// 不接收事件
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, ev: CoordinatorEvent) {
        if let Some(t) = &self.tx {
            let _ = t.send(ev);
        }
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.emit(CoordinatorEvent::Progress {
            message: message.into(),
        });
    }
}
