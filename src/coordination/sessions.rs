//! Agent 间消息总线
//!
//! 已知 Agent 的目录 + 只追加、有上限的消息日志。用于状态 / 错误传播与查询，不驱动控制流。

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::agents::AgentRole;
use crate::state::{now_ms, AgentStatus};
use crate::workflow::AgentId;

/// 默认保留的消息条数
pub const DEFAULT_MAX_MESSAGES: usize = 1000;
/// 广播给所有 Agent 的收件人
pub const BROADCAST: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResult,
    StatusUpdate,
    ErrorReport,
    Handoff,
    Query,
    Response,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub id: String,
    pub from: AgentId,
    pub to: AgentId,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl SessionMessage {
    pub fn new(
        from: impl Into<AgentId>,
        to: impl Into<AgentId>,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            from: from.into(),
            to: to.into(),
            content: content.into(),
            message_type,
            timestamp: now_ms(),
            reply_to: None,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn in_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    fn involves(&self, agent_id: &str) -> bool {
        self.from == agent_id || self.to == agent_id || self.to == BROADCAST
    }
}

/// 目录中的一条 Agent 记录
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: AgentId,
    pub name: String,
    pub role: AgentRole,
    pub status: AgentStatus,
}

pub struct SessionsBus {
    directory: RwLock<BTreeMap<AgentId, AgentInfo>>,
    log: RwLock<VecDeque<SessionMessage>>,
    max_messages: usize,
    notify: broadcast::Sender<SessionMessage>,
}

impl SessionsBus {
    pub fn new(max_messages: usize) -> Self {
        let (notify, _) = broadcast::channel(64);
        Self {
            directory: RwLock::new(BTreeMap::new()),
            log: RwLock::new(VecDeque::new()),
            max_messages: max_messages.max(1),
            notify,
        }
    }

    pub async fn register(&self, info: AgentInfo) {
        tracing::debug!(agent = %info.id, role = ?info.role, "Agent registered on bus");
        self.directory.write().await.insert(info.id.clone(), info);
    }

    pub async fn unregister(&self, agent_id: &str) -> bool {
        self.directory.write().await.remove(agent_id).is_some()
    }

    pub async fn agents(&self) -> Vec<AgentInfo> {
        self.directory.read().await.values().cloned().collect()
    }

    pub async fn is_registered(&self, agent_id: &str) -> bool {
        self.directory.read().await.contains_key(agent_id)
    }

    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) {
        if let Some(info) = self.directory.write().await.get_mut(agent_id) {
            info.status = status;
        }
    }

    /// 查询另一个 Agent 的状态
    pub async fn query_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.directory.read().await.get(agent_id).map(|i| i.status)
    }

    /// 追加一条消息，超过上限时丢弃最旧的；返回消息 ID
    pub async fn send(&self, message: SessionMessage) -> String {
        let id = message.id.clone();
        {
            let mut log = self.log.write().await;
            log.push_back(message.clone());
            while log.len() > self.max_messages {
                log.pop_front();
            }
        }
        let _ = self.notify.send(message);
        id
    }

    /// 便捷发送：from → to 的普通查询消息
    pub async fn send_message(&self, from: &str, to: &str, content: &str) -> String {
        self.send(SessionMessage::new(from, to, MessageType::Query, content))
            .await
    }

    /// 与该 Agent 相关（发出、收到或广播）的最近 limit 条消息，最新的在最后
    pub async fn get_message_history(&self, agent_id: &str, limit: usize) -> Vec<SessionMessage> {
        let log = self.log.read().await;
        let mut recent: Vec<SessionMessage> = log
            .iter()
            .rev()
            .filter(|m| m.involves(agent_id))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    pub async fn len(&self) -> usize {
        self.log.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.read().await.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionMessage> {
        self.notify.subscribe()
    }
}

impl Default for SessionsBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, role: AgentRole) -> AgentInfo {
        AgentInfo {
            id: id.to_string(),
            name: id.to_string(),
            role,
            status: AgentStatus::Idle,
        }
    }

    #[tokio::test]
    async fn test_directory_status_query() {
        let bus = SessionsBus::default();
        bus.register(info("architect", AgentRole::Architect)).await;
        bus.set_status("architect", AgentStatus::Executing).await;

        assert_eq!(bus.query_status("architect").await, Some(AgentStatus::Executing));
        assert_eq!(bus.query_status("ghost").await, None);
        assert!(bus.unregister("architect").await);
        assert!(!bus.is_registered("architect").await);
    }

    #[tokio::test]
    async fn test_history_filters_by_agent() {
        let bus = SessionsBus::default();
        bus.send_message("qa", "architect", "is main.tscn saved?").await;
        bus.send_message("level", "character", "tileset ready").await;
        bus.send(SessionMessage::new("orchestrator", BROADCAST, MessageType::StatusUpdate, "plan started"))
            .await;

        let history = bus.get_message_history("architect", 10).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "is main.tscn saved?");
        assert_eq!(history[1].to, BROADCAST);
    }

    #[tokio::test]
    async fn test_log_is_bounded() {
        let bus = SessionsBus::new(3);
        for i in 0..5 {
            bus.send_message("a", "b", &format!("m{i}")).await;
        }
        assert_eq!(bus.len().await, 3);
        let history = bus.get_message_history("a", 10).await;
        assert_eq!(history.first().unwrap().content, "m2");
        assert_eq!(history.last().unwrap().content, "m4");
    }

    #[tokio::test]
    async fn test_reply_links_and_notifies() {
        let bus = SessionsBus::default();
        let mut rx = bus.subscribe();
        let question = bus.send_message("qa", "architect", "status?").await;
        let answer = SessionMessage::new("architect", "qa", MessageType::Response, "busy")
            .in_reply_to(question.clone())
            .with_payload(serde_json::json!({ "status": "executing" }));
        bus.send(answer).await;

        assert_eq!(rx.recv().await.unwrap().id, question);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.reply_to.as_deref(), Some(question.as_str()));
        assert_eq!(reply.payload.unwrap()["status"], "executing");
    }
}
