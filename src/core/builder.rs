//! 编排器构建器：统一的初始化逻辑
//!
//! 组装 CoordinatorContext（状态、锁、消息总线、错误日志、工具执行器、推理客户端、审批闸门、事件出口），
//! 注册 Agent，并由已注册 Agent 声明的任务类型推导规划器的能力表。

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agents::{
    Agent, ApprovalChannel, ArchitectAgent, CharacterAgent, CoordinatorAgent, LevelAgent, QaAgent,
};
use crate::config::AppConfig;
use crate::coordination::AgentInfo;
use crate::core::context::CoordinatorContext;
use crate::core::error::CoordinatorError;
use crate::core::events::{CoordinatorEvent, EventSink};
use crate::core::orchestrator::Orchestrator;
use crate::core::task_scheduler::TaskScheduler;
use crate::llm::{MockReasoningClient, ReasoningClient};
use crate::state::AgentStatus;
use crate::tools::{SimulatedEditor, ToolExecutor};
use crate::workflow::{AgentId, CapabilityTable, TaskPlanner};

pub struct CoordinatorBuilder {
    config: AppConfig,
    tools: Option<Arc<dyn ToolExecutor>>,
    reasoning: Option<Arc<dyn ReasoningClient>>,
    approval: Option<Arc<dyn ApprovalChannel>>,
    events: EventSink,
    agents: Vec<Arc<dyn Agent>>,
    spawn_reaper: bool,
}

impl CoordinatorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            tools: None,
            reasoning: None,
            approval: None,
            events: EventSink::disabled(),
            agents: Vec::new(),
            spawn_reaper: true,
        }
    }

    /// 工具执行器；未设置时使用空的模拟编辑器
    pub fn with_tool_executor(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// 推理客户端；未设置时使用 Mock
    pub fn with_reasoning(mut self, reasoning: Arc<dyn ReasoningClient>) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    pub fn with_approval_channel(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.approval = Some(channel);
        self
    }

    pub fn with_event_sender(mut self, tx: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// 注册五个内置 Agent
    pub fn with_default_agents(self) -> Self {
        let settings = self.config.agents.clone();
        self.with_agent(Arc::new(CoordinatorAgent::new(&settings)))
            .with_agent(Arc::new(ArchitectAgent::new(&settings)))
            .with_agent(Arc::new(CharacterAgent::new(&settings)))
            .with_agent(Arc::new(LevelAgent::new(&settings)))
            .with_agent(Arc::new(QaAgent::new(&settings)))
    }

    /// 是否启动后台锁回收任务
    pub fn with_lock_reaper(mut self, enabled: bool) -> Self {
        self.spawn_reaper = enabled;
        self
    }

    pub async fn build(self) -> Result<Orchestrator, CoordinatorError> {
        if self.agents.is_empty() {
            return Err(CoordinatorError::NoAgents);
        }

        let mut registry: BTreeMap<AgentId, Arc<dyn Agent>> = BTreeMap::new();
        let mut capabilities = CapabilityTable::new();
        for agent in &self.agents {
            let id = agent.id().to_string();
            if registry.contains_key(&id) {
                return Err(CoordinatorError::DuplicateAgent(id));
            }
            for task_type in agent.handled_task_types() {
                if !capabilities.assign(*task_type, id.clone()) {
                    tracing::debug!(agent = %id, %task_type, "Task type already covered by another agent");
                }
            }
            registry.insert(id, agent.clone());
        }

        let tools = self
            .tools
            .unwrap_or_else(|| Arc::new(SimulatedEditor::new()) as Arc<dyn ToolExecutor>);
        let reasoning = self
            .reasoning
            .unwrap_or_else(|| Arc::new(MockReasoningClient::new()) as Arc<dyn ReasoningClient>);
        let ctx = Arc::new(CoordinatorContext::new(
            &self.config,
            tools,
            reasoning,
            self.approval,
            self.events,
        ));

        for agent in registry.values() {
            let config = agent.config();
            ctx.sessions
                .register(AgentInfo {
                    id: config.id.clone(),
                    name: config.name.clone(),
                    role: config.role,
                    status: AgentStatus::Idle,
                })
                .await;
            ctx.state.update_agent_state(&config.id, agent.status().await).await;
        }

        let reaper_cancel = CancellationToken::new();
        let reaper = self.spawn_reaper.then(|| {
            ctx.locks
                .spawn_reaper(self.config.locks.reaper_interval(), reaper_cancel.clone())
        });

        let coordinator = &self.config.coordinator;
        tracing::info!(
            agents = registry.len(),
            multi_agent = coordinator.enabled,
            max_parallel = coordinator.max_parallel_agents,
            "Coordinator ready"
        );
        Ok(Orchestrator::new(
            ctx,
            registry,
            TaskPlanner::new(capabilities),
            TaskScheduler::new(coordinator.max_parallel_agents),
            coordinator.enabled,
            reaper_cancel,
            reaper,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_requires_agents() {
        let err = CoordinatorBuilder::new(AppConfig::default()).build().await.err();
        assert!(matches!(err, Some(CoordinatorError::NoAgents)));
    }

    #[tokio::test]
    async fn test_duplicate_agent_ids_rejected() {
        let settings = AppConfig::default().agents;
        let err = CoordinatorBuilder::new(AppConfig::default())
            .with_agent(Arc::new(LevelAgent::new(&settings)))
            .with_agent(Arc::new(LevelAgent::new(&settings)))
            .build()
            .await
            .err();
        assert!(matches!(err, Some(CoordinatorError::DuplicateAgent(id)) if id == "level"));
    }

    #[tokio::test]
    async fn test_default_agents_are_registered_on_the_bus() {
        let orchestrator = CoordinatorBuilder::new(AppConfig::default())
            .with_default_agents()
            .with_lock_reaper(false)
            .build()
            .await
            .unwrap();

        assert_eq!(
            orchestrator.agent_ids(),
            vec!["architect", "character", "coordinator", "level", "qa"]
        );
        let sessions = &orchestrator.context().sessions;
        assert_eq!(sessions.agents().await.len(), 5);
        assert_eq!(sessions.query_status("qa").await, Some(AgentStatus::Idle));
        assert!(orchestrator.get_state().await.agent_states.contains_key("architect"));
    }
}
