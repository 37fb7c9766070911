//! 人工审批
//!
//! ApprovalGate 包装可选的 ApprovalChannel：未接入时记录日志后放行；接入时在超时内等待答复，
//! 超时后使用配置的默认结果。ChannelApproval 把请求投递到通道，由接收方通过 oneshot 答复。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::core::phase::PhaseTracker;

/// 审批通道
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn request(&self, agent_id: &str, operation: &str, details: &Value) -> bool;
}

/// 投递给审批方的请求
#[derive(Debug)]
pub struct ApprovalRequest {
    pub id: String,
    pub agent_id: String,
    pub operation: String,
    pub details: Value,
    pub respond: oneshot::Sender<bool>,
}

/// 基于通道的审批：审批方丢弃请求（未答复）时视为拒绝
pub struct ChannelApproval {
    tx: mpsc::UnboundedSender<ApprovalRequest>,
}

impl ChannelApproval {
    pub fn new(tx: mpsc::UnboundedSender<ApprovalRequest>) -> Self {
        Self { tx }
    }

    /// 创建通道对：审批实现 + 请求接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl ApprovalChannel for ChannelApproval {
    async fn request(&self, agent_id: &str, operation: &str, details: &Value) -> bool {
        let (respond, answer) = oneshot::channel();
        let request = ApprovalRequest {
            id: format!("approval_{}", uuid::Uuid::new_v4()),
            agent_id: agent_id.to_string(),
            operation: operation.to_string(),
            details: details.clone(),
            respond,
        };
        if self.tx.send(request).is_err() {
            tracing::warn!(agent = agent_id, operation, "Approval channel closed, denying");
            return false;
        }
        answer.await.unwrap_or(false)
    }
}

/// 审批闸门
#[derive(Clone)]
pub struct ApprovalGate {
    channel: Option<Arc<dyn ApprovalChannel>>,
    timeout: Duration,
    default_on_timeout: bool,
}

impl ApprovalGate {
    pub fn new(
        channel: Option<Arc<dyn ApprovalChannel>>,
        timeout: Duration,
        default_on_timeout: bool,
    ) -> Self {
        Self {
            channel,
            timeout,
            default_on_timeout,
        }
    }

    /// 不接入审批通道：全部放行
    pub fn auto_approve() -> Self {
        Self::new(None, Duration::from_secs(30), true)
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub async fn request(
        &self,
        agent_id: &str,
        operation: &str,
        details: &Value,
        phase: &PhaseTracker,
    ) -> bool {
        let Some(channel) = &self.channel else {
            tracing::info!(agent = agent_id, operation, "No approval channel, proceeding");
            return true;
        };

        phase.enter_approval();
        let answer = tokio::time::timeout(self.timeout, channel.request(agent_id, operation, details)).await;
        phase.leave_approval();

        match answer {
            Ok(approved) => {
                tracing::info!(agent = agent_id, operation, approved, "Approval answered");
                approved
            }
            Err(_) => {
                tracing::warn!(
                    agent = agent_id,
                    operation,
                    default = self.default_on_timeout,
                    "Approval timed out, applying default"
                );
                self.default_on_timeout
            }
        }
    }
}
