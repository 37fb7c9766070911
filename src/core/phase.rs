//! 编排器阶段状态机
//!
//! idle → planning → dispatching → (awaiting_agent | awaiting_approval) → aggregating → (completed | failed)，
//! 任一非终止状态可进入 cancelled。通过 watch 通道广播当前阶段。

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorPhase {
    Idle,
    Planning,
    Dispatching,
    AwaitingAgent,
    AwaitingApproval,
    Aggregating,
    Completed,
    Failed,
    Cancelled,
}

impl OrchestratorPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorPhase::Completed | OrchestratorPhase::Failed | OrchestratorPhase::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: OrchestratorPhase) -> bool {
        use OrchestratorPhase::*;
        if *self == next {
            return true;
        }
        if next == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle | Completed | Failed | Cancelled, Planning)
                | (Planning, Dispatching | Failed)
                | (Dispatching, AwaitingAgent | Aggregating | Failed)
                | (AwaitingAgent, AwaitingApproval | Dispatching | Aggregating | Failed)
                | (AwaitingApproval, AwaitingAgent | Failed)
                | (Aggregating, Completed | Failed)
        )
    }
}

/// 当前阶段 + 正在等待审批的请求数
pub struct PhaseTracker {
    tx: watch::Sender<OrchestratorPhase>,
    approvals_pending: AtomicUsize,
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(OrchestratorPhase::Idle);
        Self {
            tx,
            approvals_pending: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> OrchestratorPhase {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorPhase> {
        self.tx.subscribe()
    }

    /// 按状态机迁移；非法迁移被拒绝并记录
    pub fn transition(&self, next: OrchestratorPhase) -> bool {
        let mut accepted = true;
        self.tx.send_if_modified(|phase| {
            if *phase == next {
                return false;
            }
            if !phase.can_transition_to(next) {
                tracing::warn!(from = ?*phase, to = ?next, "Rejected orchestrator phase transition");
                accepted = false;
                return false;
            }
            tracing::debug!(from = ?*phase, to = ?next, "Orchestrator phase");
            *phase = next;
            true
        });
        accepted
    }

    /// 有 Agent 开始等待审批
    pub fn enter_approval(&self) {
        if self.approvals_pending.fetch_add(1, Ordering::SeqCst) == 0
            && self.current() == OrchestratorPhase::AwaitingAgent
        {
            self.transition(OrchestratorPhase::AwaitingApproval);
        }
    }

    /// 审批结束；没有其他等待者时回到 awaiting_agent
    pub fn leave_approval(&self) {
        let previous = self
            .approvals_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous <= 1 && self.current() == OrchestratorPhase::AwaitingApproval {
            self.transition(OrchestratorPhase::AwaitingAgent);
        }
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrchestratorPhase::*;

    #[test]
    fn test_happy_path() {
        let tracker = PhaseTracker::new();
        for phase in [Planning, Dispatching, AwaitingAgent, Dispatching, AwaitingAgent, Aggregating, Completed] {
            assert!(tracker.transition(phase), "{phase:?}");
        }
        assert_eq!(tracker.current(), Completed);
        assert!(tracker.transition(Planning));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let tracker = PhaseTracker::new();
        assert!(!tracker.transition(Completed));
        assert!(!tracker.transition(Aggregating));
        assert_eq!(tracker.current(), Idle);

        tracker.transition(Planning);
        tracker.transition(Failed);
        assert!(!tracker.transition(Cancelled));
    }

    #[test]
    fn test_cancel_from_any_running_phase() {
        for start in [Planning, Dispatching, AwaitingAgent, AwaitingApproval, Aggregating] {
            assert!(start.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_nested_approvals() {
        let tracker = PhaseTracker::new();
        tracker.transition(Planning);
        tracker.transition(Dispatching);
        tracker.transition(AwaitingAgent);

        tracker.enter_approval();
        tracker.enter_approval();
        assert_eq!(tracker.current(), AwaitingApproval);
        tracker.leave_approval();
        assert_eq!(tracker.current(), AwaitingApproval);
        tracker.leave_approval();
        assert_eq!(tracker.current(), AwaitingAgent);
    }
}
