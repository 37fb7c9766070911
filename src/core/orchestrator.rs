//! 编排器：主控循环
//!
//! 一次请求：planning（生成计划）→ 建立计划前检查点 → 按并行组依次 dispatching，组内并发执行，
//! 整组到达终态后才进入下一组 → aggregating（汇总产物）→ completed / failed。
//! 组与组之间响应暂停与取消；在途任务不会被打断。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::Agent;
use crate::coordination::{MessageType, SessionMessage};
use crate::core::context::CoordinatorContext;
use crate::core::error::{AgentError, CoordinatorError, ErrorCode};
use crate::core::events::CoordinatorEvent;
use crate::core::phase::OrchestratorPhase;
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::task_scheduler::TaskScheduler;
use crate::state::{now_ms, AgentState, Checkpoint, ProjectState, StateManager};
use crate::workflow::{
    AgentId, AgentResult, AgentTask, PlanError, PlanRequest, PlanStatus, TaskId, TaskPlan, TaskPlanner,
    TaskType,
};

/// 编排器在消息总线与结果中的身份
pub const ORCHESTRATOR_ID: &str = "orchestrator";

pub struct Orchestrator {
    ctx: Arc<CoordinatorContext>,
    agents: BTreeMap<AgentId, Arc<dyn Agent>>,
    planner: TaskPlanner,
    scheduler: TaskScheduler,
    supervisor: SessionSupervisor,
    multi_agent: bool,
    /// 同一时刻只处理一个请求
    running: Mutex<()>,
    reaper_cancel: CancellationToken,
    reaper: Option<JoinHandle<()>>,
}

impl Orchestrator {
    pub(crate) fn new(
        ctx: Arc<CoordinatorContext>,
        agents: BTreeMap<AgentId, Arc<dyn Agent>>,
        planner: TaskPlanner,
        scheduler: TaskScheduler,
        multi_agent: bool,
        reaper_cancel: CancellationToken,
        reaper: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            ctx,
            agents,
            planner,
            scheduler,
            supervisor: SessionSupervisor::new(),
            multi_agent,
            running: Mutex::new(()),
            reaper_cancel,
            reaper,
        }
    }

    pub fn context(&self) -> &Arc<CoordinatorContext> {
        &self.ctx
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.ctx.state
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.keys().cloned().collect()
    }

    pub async fn agent_status(&self, agent_id: &str) -> Option<AgentState> {
        match self.agents.get(agent_id) {
            Some(agent) => Some(agent.status().await),
            None => None,
        }
    }

    pub fn phase(&self) -> OrchestratorPhase {
        self.ctx.phase.current()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<OrchestratorPhase> {
        self.ctx.phase.subscribe()
    }

    pub fn is_multi_agent(&self) -> bool {
        self.multi_agent
    }

    /// 处理一条自由文本请求
    pub async fn process_request(&self, user_request: &str) -> AgentResult {
        self.process_plan_request(PlanRequest::new(user_request)).await
    }

    /// 处理请求（可带结构化子目标），返回汇总结果
    pub async fn process_plan_request(&self, request: PlanRequest) -> AgentResult {
        let _running = self.running.lock().await;
        let started = Instant::now();
        let token = self.supervisor.begin_request();
        let events = &self.ctx.events;

        self.ctx.phase.transition(OrchestratorPhase::Planning);
        events.emit(CoordinatorEvent::MultiAgentEnabled {
            enabled: self.multi_agent,
        });
        events.progress("Planning");

        let planned = if self.multi_agent {
            self.planner.plan(&request)
        } else {
            self.planner
                .single_task_plan(&request.user_request, TaskType::Analysis)
        };
        let mut plan = match planned {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "Planning failed");
                self.ctx.phase.transition(OrchestratorPhase::Failed);
                events.progress(format!("Planning failed: {e}"));
                let mut result = AgentResult::failure("plan", ORCHESTRATOR_ID, plan_error(&e));
                result.execution_time_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        if self.ctx.settings.enable_checkpoints {
            match self
                .ctx
                .state
                .create_checkpoint(&format!("before {}", plan.id), None)
                .await
            {
                Ok(id) => plan.checkpoint_id = Some(id),
                Err(e) => tracing::warn!(plan_id = %plan.id, error = %e, "Pre-plan checkpoint failed"),
            }
        }
        plan.status = PlanStatus::Executing;
        self.ctx.state.set_current_plan(Some(plan.clone())).await;
        events.emit(CoordinatorEvent::PlanCreated(plan.summary()));
        self.ctx.phase.transition(OrchestratorPhase::Dispatching);

        let mut results: Vec<AgentResult> = Vec::with_capacity(plan.tasks.len());
        let mut succeeded: HashSet<TaskId> = HashSet::new();
        let group_count = plan.parallel_groups.len();

        for (index, group) in plan.parallel_groups.iter().enumerate() {
            let paused = self.supervisor.is_paused();
            if paused {
                self.ctx.state.set_plan_status(PlanStatus::Paused).await;
                events.progress(format!("Paused before group {}/{}", index + 1, group_count));
            }
            if !self.supervisor.wait_if_paused(&token).await || token.is_cancelled() {
                return self.cancelled(&plan, results, index, started).await;
            }
            if paused {
                self.ctx.state.set_plan_status(PlanStatus::Executing).await;
            }

            let tasks: Vec<&AgentTask> = group.iter().filter_map(|id| plan.task(id)).collect();
            if let Some(blocked) = tasks
                .iter()
                .find(|t| !t.dependencies.iter().all(|d| succeeded.contains(d)))
            {
                let error = AgentError::precondition(format!(
                    "Task {} dispatched before its dependencies succeeded",
                    blocked.id
                ))
                .with_recoverable(false);
                return self.failed(&plan, results, error, started).await;
            }

            self.ctx.phase.transition(OrchestratorPhase::AwaitingAgent);
            events.progress(format!(
                "Group {}/{}: {}",
                index + 1,
                group_count,
                group.join(", ")
            ));
            tracing::info!(plan_id = %plan.id, group = index + 1, tasks = tasks.len(), "Dispatching group");

            let group_results = join_all(tasks.iter().map(|task| self.dispatch(task))).await;
            self.ctx.phase.transition(OrchestratorPhase::Dispatching);

            let mut first_failure: Option<AgentError> = None;
            for result in group_results {
                if result.success {
                    succeeded.insert(result.task_id.clone());
                } else if first_failure.is_none() {
                    let cause = result
                        .error
                        .clone()
                        .unwrap_or_else(|| AgentError::new(ErrorCode::ToolFailure, "unknown failure"));
                    first_failure = Some(AgentError {
                        message: format!("Task {} failed: {}", result.task_id, cause.message),
                        ..cause
                    });
                }
                results.push(result);
            }
            if let Some(error) = first_failure {
                return self.failed(&plan, results, error, started).await;
            }
        }

        self.ctx.phase.transition(OrchestratorPhase::Aggregating);
        self.ctx.state.set_plan_status(PlanStatus::Completed).await;
        self.ctx.phase.transition(OrchestratorPhase::Completed);
        events.progress(format!("Plan {} completed", plan.id));
        tracing::info!(plan_id = %plan.id, tasks = results.len(), "Plan completed");
        aggregate(&plan, results, None, started)
    }

    async fn dispatch(&self, task: &AgentTask) -> AgentResult {
        let Some(agent) = self.agents.get(&task.assigned_agent) else {
            return AgentResult::failure(
                task.id.clone(),
                task.assigned_agent.clone(),
                AgentError::precondition(format!("No agent registered as {}", task.assigned_agent))
                    .with_recoverable(false),
            );
        };
        if let Some(deadline) = task.deadline {
            if now_ms() > deadline {
                return AgentResult::failure(
                    task.id.clone(),
                    task.assigned_agent.clone(),
                    AgentError::new(ErrorCode::Timeout, format!("Deadline passed before {} started", task.id)),
                );
            }
        }
        let Some(_permit) = self.scheduler.acquire().await else {
            return AgentResult::failure(
                task.id.clone(),
                task.assigned_agent.clone(),
                AgentError::cancelled("Scheduler closed"),
            );
        };

        self.ctx
            .sessions
            .send(
                SessionMessage::new(
                    ORCHESTRATOR_ID,
                    task.assigned_agent.clone(),
                    MessageType::TaskRequest,
                    task.description.clone(),
                )
                .with_payload(json!({ "task": task.id, "type": task.task_type })),
            )
            .await;
        agent.execute(task, &self.ctx).await
    }

    async fn failed(
        &self,
        plan: &TaskPlan,
        results: Vec<AgentResult>,
        error: AgentError,
        started: Instant,
    ) -> AgentResult {
        self.ctx.state.set_plan_status(PlanStatus::Failed).await;
        self.ctx.phase.transition(OrchestratorPhase::Failed);
        self.ctx.events.progress(format!("Plan {} failed: {}", plan.id, error.message));
        tracing::warn!(plan_id = %plan.id, code = %error.code, "Plan failed: {}", error.message);
        aggregate(plan, results, Some(error), started)
    }

    async fn cancelled(
        &self,
        plan: &TaskPlan,
        results: Vec<AgentResult>,
        group_index: usize,
        started: Instant,
    ) -> AgentResult {
        self.ctx.state.set_plan_status(PlanStatus::Failed).await;
        self.ctx.phase.transition(OrchestratorPhase::Cancelled);
        self.ctx.events.progress(format!("Plan {} cancelled", plan.id));
        tracing::info!(plan_id = %plan.id, group = group_index + 1, "Plan cancelled");
        let error = AgentError::cancelled(format!(
            "Cancelled before group {} of {}",
            group_index + 1,
            plan.parallel_groups.len()
        ));
        aggregate(plan, results, Some(error), started)
    }

    /// 取消当前请求：不再派发后续组
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested");
        self.supervisor.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.supervisor.is_cancelled()
    }

    /// 在组与组之间暂停派发
    pub async fn pause(&self) {
        self.supervisor.set_paused(true);
        if self.current_plan_status().await == Some(PlanStatus::Executing) {
            self.ctx.state.set_plan_status(PlanStatus::Paused).await;
        }
    }

    pub async fn resume(&self) {
        self.supervisor.set_paused(false);
        if self.current_plan_status().await == Some(PlanStatus::Paused) {
            self.ctx.state.set_plan_status(PlanStatus::Executing).await;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.supervisor.is_paused()
    }

    async fn current_plan_status(&self) -> Option<PlanStatus> {
        self.ctx.state.current_plan().await.map(|p| p.status)
    }

    pub async fn get_state(&self) -> ProjectState {
        self.ctx.state.get_state().await
    }

    pub async fn create_checkpoint(&self, label: &str) -> Result<String, CoordinatorError> {
        Ok(self.ctx.state.create_checkpoint(label, None).await?)
    }

    /// 回滚；当前计划保留在状态中并标记为 rolled_back
    pub async fn rollback_to_checkpoint(&self, checkpoint_id: &str) -> bool {
        let plan = self.ctx.state.current_plan().await;
        if !self.ctx.state.rollback_to_checkpoint(checkpoint_id).await {
            return false;
        }
        if let Some(mut plan) = plan {
            plan.status = PlanStatus::RolledBack;
            self.ctx.state.set_current_plan(Some(plan)).await;
        }
        self.ctx.events.progress(format!("Rolled back to {checkpoint_id}"));
        true
    }

    pub async fn get_checkpoint_history(&self, limit: usize) -> Vec<Checkpoint> {
        self.ctx.state.get_checkpoint_history(limit).await
    }

    /// 以编排器身份向 Agent 发送消息
    pub async fn send_message(&self, to_agent_id: &str, content: &str) -> String {
        self.ctx
            .sessions
            .send_message(ORCHESTRATOR_ID, to_agent_id, content)
            .await
    }

    pub async fn get_message_history(&self, agent_id: &str, limit: usize) -> Vec<SessionMessage> {
        self.ctx.sessions.get_message_history(agent_id, limit).await
    }

    /// 停止后台锁回收任务
    pub async fn shutdown(&mut self) {
        self.reaper_cancel.cancel();
        if let Some(handle) = self.reaper.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Lock reaper ended abnormally");
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.reaper_cancel.cancel();
    }
}

fn plan_error(e: &PlanError) -> AgentError {
    let code = match e {
        PlanError::NoCapableAgent(_) => ErrorCode::PreconditionFailed,
        _ => ErrorCode::Validation,
    };
    AgentError::new(code, e.to_string()).with_recoverable(false)
}

/// 汇总：全部产物（去重、保持顺序）、token 总数与逐任务结果
fn aggregate(
    plan: &TaskPlan,
    results: Vec<AgentResult>,
    error: Option<AgentError>,
    started: Instant,
) -> AgentResult {
    let mut aggregated = match error {
        None => AgentResult::success(plan.id.clone(), ORCHESTRATOR_ID),
        Some(e) => AgentResult::failure(plan.id.clone(), ORCHESTRATOR_ID, e),
    };

    let mut seen = HashSet::new();
    let mut tasks = Map::new();
    let mut per_agent: HashMap<&str, u64> = HashMap::new();
    for r in &results {
        for artifact in &r.artifacts {
            if seen.insert(artifact.clone()) {
                aggregated.artifacts.push(artifact.clone());
            }
        }
        aggregated.tokens_used += r.tokens_used;
        *per_agent.entry(r.agent_id.as_str()).or_default() += r.tokens_used;
        tasks.insert(r.task_id.clone(), json!(r));
    }

    aggregated.output.insert("plan".into(), json!(plan.summary()));
    aggregated.output.insert("tasks".into(), Value::Object(tasks));
    aggregated.output.insert("tokensByAgent".into(), json!(per_agent));
    if let Some(cp) = &plan.checkpoint_id {
        aggregated.output.insert("checkpointId".into(), json!(cp));
    }
    aggregated.execution_time_ms = started.elapsed().as_millis() as u64;
    aggregated
}
