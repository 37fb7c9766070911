//! Agent 通用执行循环
//!
//! 各专职 Agent 共用：推理 → 工具调用 → 观察，最多 max_iterations 轮。每次修改型调用先取得资源的独占锁，
//! 破坏性调用先经过审批并建检查点；工具失败经分类与恢复规划后重试、改参重试、前置修复或终止。
//! 成功的调用按工具目录同步到 ProjectState。任务结束（无论成败）释放该 Agent 持有的全部锁。
//! 迭代用尽仍未给出最终答复、或超出 token 预算，任务按失败处理。

use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};

use crate::coordination::{MessageType, SessionMessage, BROADCAST};
use crate::core::context::CoordinatorContext;
use crate::core::error::{AgentError, ErrorCode, RecoveryAction};
use crate::core::events::CoordinatorEvent;
use crate::llm::{Observation, ReasoningContext};
use crate::state::{now_ms, AgentState, AgentStatus, LockType, NodeRecord, SceneState};
use crate::tools::catalog::{self, StateEffect};
use crate::tools::{ToolCall, ToolResult};
use crate::workflow::{AgentResult, AgentTask};

use super::AgentConfig;

/// 场景依赖所在的参数名
const DEPENDENCY_PARAMS: &[&str] = &["texture", "script", "tileset", "sprite_frames", "resource"];

/// 观察摘要的最大长度
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 一次成功的工具调用（恢复后的最终参数）
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call: ToolCall,
    pub result: ToolResult,
}

/// Agent 运行时：静态配置 + 可变状态
///
/// 锁按 Agent ID 持有、任务结束时整体释放，因此同一 Agent 的任务必须串行：
/// `task_slot` 在整个任务期间被占用。
pub struct AgentRuntime {
    config: AgentConfig,
    state: Mutex<AgentState>,
    task_slot: Mutex<()>,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AgentState::default()),
            task_slot: Mutex::new(()),
        }
    }

    /// 占用任务槽；同一 Agent 的并发任务在此排队
    pub async fn occupy(&self) -> MutexGuard<'_, ()> {
        match self.task_slot.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(agent = %self.config.id, "Agent busy, queueing task");
                self.task_slot.lock().await
            }
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn has_tool_access(&self, tool: &str) -> bool {
        self.config.has_tool_access(tool)
    }

    pub async fn status(&self) -> AgentState {
        self.state.lock().await.clone()
    }

    /// 更新状态并同步到 ProjectState、消息总线与事件出口
    pub async fn set_status(&self, ctx: &CoordinatorContext, status: AgentStatus, progress: f32) {
        let snapshot = {
            let mut st = self.state.lock().await;
            if !st.status.can_transition_to(status) {
                tracing::warn!(
                    agent = %self.config.id,
                    from = st.status.as_str(),
                    to = status.as_str(),
                    "Unexpected agent status transition"
                );
            }
            st.status = status;
            st.last_activity = now_ms();
            st.clone()
        };

        ctx.state.update_agent_state(&self.config.id, snapshot.clone()).await;
        ctx.sessions.set_status(&self.config.id, status).await;
        ctx.sessions
            .send(
                SessionMessage::new(
                    self.config.id.clone(),
                    BROADCAST,
                    MessageType::StatusUpdate,
                    format!("{} is {}", self.config.name, status.as_str()),
                )
                .with_payload(json!({ "status": status, "task": snapshot.current_task })),
            )
            .await;
        ctx.events.emit(CoordinatorEvent::AgentStatus {
            name: self.config.name.clone(),
            role: self.config.role,
            state: status,
            progress: progress.clamp(0.0, 1.0),
        });
    }

    /// 请求人工审批；等待期间状态为 waiting
    pub async fn request_approval(&self, ctx: &CoordinatorContext, operation: &str, details: &Value) -> bool {
        self.set_status(ctx, AgentStatus::Waiting, 0.5).await;
        let approved = ctx
            .approvals
            .request(&self.config.id, operation, details, &ctx.phase)
            .await;
        self.set_status(ctx, AgentStatus::Executing, 0.5).await;
        approved
    }

    /// 开始一个任务：上个任务的终态先回到 idle
    pub async fn begin_task(&self, ctx: &CoordinatorContext, task: &AgentTask) {
        {
            let mut st = self.state.lock().await;
            if matches!(st.status, AgentStatus::Complete | AgentStatus::Error) {
                st.status = AgentStatus::Idle;
            }
            st.current_task = Some(task.id.clone());
            st.last_error = None;
        }
        tracing::info!(agent = %self.config.id, task = %task.id, task_type = %task.task_type, "Task started");
        self.set_status(ctx, AgentStatus::Analyzing, 0.0).await;
    }

    /// 成功收尾：释放锁、置为 complete、向编排器回报
    pub async fn finish_success(
        &self,
        ctx: &CoordinatorContext,
        mut result: AgentResult,
        tokens: u64,
        started: Instant,
    ) -> AgentResult {
        let released = ctx.locks.release_all_locks(&self.config.id).await;
        result.tokens_used = tokens;
        result.execution_time_ms = started.elapsed().as_millis() as u64;
        {
            let mut st = self.state.lock().await;
            st.tokens_used += tokens;
        }
        self.set_status(ctx, AgentStatus::Complete, 1.0).await;
        ctx.sessions
            .send(
                SessionMessage::new(
                    self.config.id.clone(),
                    "orchestrator",
                    MessageType::TaskResult,
                    format!("Task {} completed", result.task_id),
                )
                .with_payload(json!({ "artifacts": result.artifacts })),
            )
            .await;
        self.state.lock().await.current_task = None;
        tracing::info!(
            agent = %self.config.id,
            task = %result.task_id,
            released,
            elapsed_ms = result.execution_time_ms,
            "Task completed"
        );
        result
    }

    /// 失败收尾：释放锁、置为 error、发送错误报告；已产生的产物保留在结果中
    pub async fn finish_failure(
        &self,
        ctx: &CoordinatorContext,
        task: &AgentTask,
        error: AgentError,
        artifacts: Vec<String>,
        tokens: u64,
        started: Instant,
    ) -> AgentResult {
        let released = ctx.locks.release_all_locks(&self.config.id).await;
        {
            let mut st = self.state.lock().await;
            st.tokens_used += tokens;
            st.last_error = Some(error.to_string());
        }
        self.set_status(ctx, AgentStatus::Error, 1.0).await;
        ctx.sessions
            .send(
                SessionMessage::new(
                    self.config.id.clone(),
                    "orchestrator",
                    MessageType::ErrorReport,
                    error.message.clone(),
                )
                .with_payload(json!({ "task": task.id, "error": error })),
            )
            .await;
        self.state.lock().await.current_task = None;
        tracing::warn!(
            agent = %self.config.id,
            task = %task.id,
            code = %error.code,
            released,
            "Task failed: {}",
            error.message
        );

        let mut result = AgentResult::failure(task.id.clone(), self.config.id.clone(), error);
        result.artifacts = artifacts;
        result.tokens_used = tokens;
        result.execution_time_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// 标准推理-工具循环
    pub async fn run_task(&self, task: &AgentTask, ctx: &CoordinatorContext) -> AgentResult {
        let _slot = self.occupy().await;
        let started = Instant::now();
        self.begin_task(ctx, task).await;

        let max_iterations = self.config.max_iterations.max(1);
        let mut artifacts: Vec<String> = Vec::new();
        let mut observations: Vec<Observation> = Vec::new();
        let mut tokens = 0u64;
        let mut summary = String::new();
        let mut calls_made = 0usize;
        let mut finished = false;

        for iteration in 0..max_iterations {
            let reasoning_ctx = ReasoningContext {
                agent_id: self.config.id.clone(),
                role: self.config.role,
                goal: self.config.goal.clone(),
                task: task.clone(),
                allowed_tools: self.config.allowed_tools(),
                iteration,
                observations: observations.clone(),
            };
            let response = match ctx.reasoning.send(&reasoning_ctx, None).await {
                Ok(r) => r,
                Err(e) => {
                    let error = AgentError::new(ErrorCode::ExternalError, format!("Reasoning failed: {e}"));
                    return self.finish_failure(ctx, task, error, artifacts, tokens, started).await;
                }
            };
            tokens += response.tokens_used;
            summary = response.text.clone();
            if response.is_final() {
                finished = true;
                break;
            }
            if tokens > self.config.max_tokens {
                tracing::warn!(agent = %self.config.id, tokens, "Token budget exceeded, stopping");
                let error = AgentError::new(
                    ErrorCode::ToolFailure,
                    format!("Token budget of {} exceeded ({tokens} used)", self.config.max_tokens),
                )
                .with_recoverable(false)
                .with_suggestion("Split the request into smaller tasks or raise max_tokens");
                return self.finish_failure(ctx, task, error, artifacts, tokens, started).await;
            }

            let progress = (iteration + 1) as f32 / (max_iterations + 1) as f32;
            self.set_status(ctx, AgentStatus::Executing, progress).await;
            for call in response.tool_calls {
                match self.invoke(ctx, call).await {
                    Ok(outcome) => {
                        calls_made += 1;
                        if catalog::is_mutating(&outcome.call.name) {
                            if let Some(path) = catalog::resource_path(&outcome.call) {
                                if !artifacts.contains(&path) {
                                    artifacts.push(path);
                                }
                            }
                        }
                        observations.push(Observation {
                            tool: outcome.call.name.clone(),
                            success: true,
                            summary: preview(outcome.result.data.as_ref()),
                        });
                    }
                    Err(error) => {
                        return self.finish_failure(ctx, task, error, artifacts, tokens, started).await;
                    }
                }
            }
            self.set_status(ctx, AgentStatus::Analyzing, progress).await;
        }

        if !finished {
            tracing::warn!(agent = %self.config.id, task = %task.id, max_iterations, "Iteration limit reached");
            let error = AgentError::new(
                ErrorCode::Timeout,
                format!("Task {} did not finish within {max_iterations} iteration(s)", task.id),
            )
            .with_recoverable(false)
            .with_suggestion("Raise max_iterations or narrow the task");
            return self.finish_failure(ctx, task, error, artifacts, tokens, started).await;
        }

        self.set_status(ctx, AgentStatus::Verifying, 0.9).await;
        let mut result = AgentResult::success(task.id.clone(), self.config.id.clone())
            .with_output("summary", Value::String(summary))
            .with_output("toolCalls", json!(calls_made));
        result.artifacts = artifacts;
        self.finish_success(ctx, result, tokens, started).await
    }

    /// 执行单个工具调用：权限 → 加锁 → 审批 / 检查点 → 带恢复的执行 → 状态同步
    pub async fn invoke(&self, ctx: &CoordinatorContext, call: ToolCall) -> Result<ToolOutcome, AgentError> {
        if !self.has_tool_access(&call.name) {
            return Err(AgentError::precondition(format!(
                "Agent {} has no access to tool {}",
                self.config.id, call.name
            ))
            .with_recoverable(false)
            .with_suggestion("Route the operation to the agent that owns this tool"));
        }

        let resource = catalog::resource_path(&call);
        if catalog::is_mutating(&call.name) {
            if let Some(path) = &resource {
                self.lock_resource(ctx, path, &call.name).await?;
            }
        }

        if catalog::lookup(&call.name).is_some_and(|s| s.destructive) {
            let details = json!({ "tool": call.name, "params": call.params, "resource": resource });
            if !self.request_approval(ctx, &call.name, &details).await {
                return Err(AgentError::cancelled(format!("{} was not approved", call.name))
                    .with_suggestion("Ask the user to approve the operation"));
            }
            if ctx.settings.enable_checkpoints {
                let label = format!("before {} {}", call.name, resource.as_deref().unwrap_or_default());
                if let Err(e) = ctx.state.create_checkpoint(label.trim_end(), Some(&self.config.id)).await {
                    tracing::warn!(agent = %self.config.id, error = %e, "Checkpoint before destructive call failed");
                }
            }
        }

        let outcome = self.execute_with_recovery(ctx, call).await?;
        self.apply_effect(ctx, &outcome.call).await;
        Ok(outcome)
    }

    async fn lock_resource(&self, ctx: &CoordinatorContext, path: &str, operation: &str) -> Result<(), AgentError> {
        let settings = &ctx.settings;
        let acquired = ctx
            .locks
            .acquire_lock_with_retry(
                &self.config.id,
                path,
                LockType::Exclusive,
                operation,
                Some(settings.lock_ttl_ms),
                settings.lock_retries,
                settings.lock_retry_delay,
            )
            .await;
        if acquired {
            return Ok(());
        }
        let holder = ctx
            .state
            .detect_conflicts(&self.config.id, &[path.to_string()])
            .await
            .into_iter()
            .next()
            .map(|c| format!("{} ({})", c.held_by, c.operation))
            .unwrap_or_else(|| "another agent".to_string());
        Err(AgentError::precondition(format!("Resource {path} is locked by {holder}")))
    }

    /// 执行并按恢复计划处理失败；前置修复调用不计入重试次数
    pub async fn execute_with_recovery(
        &self,
        ctx: &CoordinatorContext,
        call: ToolCall,
    ) -> Result<ToolOutcome, AgentError> {
        let mut current = call;
        let mut failures = 0u32;
        loop {
            let result = ctx.tools.execute(&current).await;
            ctx.error_log.record_call(&current.name, result.success);
            if result.success {
                return Ok(ToolOutcome { call: current, result });
            }

            failures += 1;
            ctx.error_log
                .record_failure(&current.name, &current.params, &result.code, &result.message, failures);
            let classification = ctx.classifier.classify_error(&result, &current.name);
            if !result.recoverable {
                return Err(AgentError::new(classification.code, result.message.clone())
                    .with_recoverable(false)
                    .with_suggestion(classification.suggested_action));
            }

            let plan = ctx
                .recovery
                .generate_recovery_plan(&current, &result, failures, &classification);
            let looping = ctx.error_log.is_failure_loop(
                &current.name,
                &result.message,
                ctx.settings.failure_loop_threshold,
            );
            ctx.events.emit(CoordinatorEvent::Recovery {
                agent: self.config.id.clone(),
                tool: current.name.clone(),
                action: recovery_label(&plan.action).to_string(),
                detail: plan.reason.clone(),
            });

            match plan.action {
                RecoveryAction::Abort => {
                    return Err(AgentError::new(classification.code, plan.user_message)
                        .with_suggestion(classification.suggested_action));
                }
                _ if looping => {
                    return Err(AgentError::new(
                        classification.code,
                        format!("{} keeps failing with the same error: {}", current.name, result.message),
                    )
                    .with_suggestion(classification.suggested_action));
                }
                RecoveryAction::Retry => {
                    tracing::info!(agent = %self.config.id, tool = %current.name, failures, "Retrying tool call");
                }
                RecoveryAction::RetryWithParams(params) => {
                    let previous = catalog::resource_path(&current);
                    current.params = params;
                    if catalog::is_mutating(&current.name) {
                        if let Some(path) = catalog::resource_path(&current) {
                            if previous.as_deref() != Some(path.as_str()) {
                                self.lock_resource(ctx, &path, &current.name).await?;
                            }
                        }
                    }
                    tracing::info!(agent = %self.config.id, tool = %current.name, "Retrying with repaired params");
                }
                RecoveryAction::PrependAndRetry(fixes) => {
                    for fix in fixes {
                        if !self.has_tool_access(&fix.name) {
                            tracing::warn!(agent = %self.config.id, tool = %fix.name, "Skipping fix without access");
                            continue;
                        }
                        let fixed = ctx.tools.execute(&fix).await;
                        ctx.error_log.record_call(&fix.name, fixed.success);
                        if !fixed.success {
                            tracing::debug!(tool = %fix.name, message = %fixed.message, "Fix call failed");
                        }
                    }
                }
            }
        }
    }

    /// 把成功调用的效果写入 ProjectState
    async fn apply_effect(&self, ctx: &CoordinatorContext, call: &ToolCall) {
        let Some(spec) = catalog::lookup(&call.name) else {
            return;
        };
        let Some(path) = catalog::resource_path(call) else {
            return;
        };
        let agent = self.config.id.clone();

        match spec.effect {
            StateEffect::None => {}
            StateEffect::CreateScene => {
                let root_type = call.param_str("root_type").unwrap_or("Node2D").to_string();
                ctx.state
                    .update_scene_state(&path, |scene| {
                        if scene.root_type.is_none() {
                            scene.root_type = Some(root_type);
                        }
                        scene.modified_by = Some(agent);
                    })
                    .await;
            }
            StateEffect::DeleteScene => {
                ctx.state.remove_scene_state(&path).await;
            }
            StateEffect::WriteAsset => {
                let existed = ctx.state.asset(&path).await.is_some();
                let asset_type = asset_type_for(&call.name, &path);
                let metadata = call.params.as_object().cloned().unwrap_or_default();
                ctx.state
                    .update_asset_state(&path, |asset| {
                        if existed {
                            asset.revision += 1;
                        }
                        asset.asset_type = asset_type.to_string();
                        asset.metadata = metadata;
                        asset.modified_by = Some(agent);
                    })
                    .await;
            }
            effect => {
                self.sync_scene(ctx, &path).await;
                ctx.state
                    .update_scene_state(&path, |scene| apply_scene_effect(scene, effect, call, agent))
                    .await;
            }
        }
    }

    /// 状态中没有该场景时从编辑器读取一次结构
    async fn sync_scene(&self, ctx: &CoordinatorContext, path: &str) {
        if ctx.state.scene(path).await.is_some() {
            return;
        }
        let result = ctx
            .tools
            .execute(&ToolCall::new("get_scene_tree", json!({ "path": path })))
            .await;
        if !result.success {
            return;
        }
        let Some(data) = result.data else {
            return;
        };
        let root_type = data.get("rootType").and_then(Value::as_str).map(str::to_string);
        let nodes: Vec<NodeRecord> = data
            .get("nodes")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        ctx.state
            .update_scene_state(path, |scene| {
                scene.root_type = root_type;
                scene.nodes = nodes;
            })
            .await;
    }
}

fn apply_scene_effect(scene: &mut SceneState, effect: StateEffect, call: &ToolCall, agent: String) {
    let param = |key: &str| call.param_str(key).map(str::to_string);
    match effect {
        StateEffect::AddNode => {
            if let Some(name) = catalog::node_name(&call.name, &call.params) {
                if scene.node(name).is_none() {
                    scene.nodes.push(NodeRecord {
                        name: name.to_string(),
                        node_type: catalog::node_type(&call.name, &call.params).to_string(),
                        parent: param("parent"),
                    });
                }
            }
        }
        StateEffect::RemoveNode => {
            if let Some(name) = param("name") {
                scene
                    .nodes
                    .retain(|n| n.name != name && n.parent.as_deref() != Some(name.as_str()));
            }
        }
        StateEffect::RenameNode => {
            if let (Some(name), Some(new_name)) = (param("name"), param("new_name")) {
                for node in scene.nodes.iter_mut() {
                    if node.name == name {
                        node.name = new_name.clone();
                    }
                    if node.parent.as_deref() == Some(name.as_str()) {
                        node.parent = Some(new_name.clone());
                    }
                }
            }
        }
        StateEffect::ReparentNode => {
            if let (Some(name), Some(parent)) = (param("name"), param("parent")) {
                for node in scene.nodes.iter_mut().filter(|n| n.name == name) {
                    node.parent = Some(parent.clone());
                }
            }
        }
        _ => {}
    }

    for key in DEPENDENCY_PARAMS {
        if let Some(dep) = call.param_str(key) {
            if dep.starts_with("res://") && !scene.dependencies.iter().any(|d| d == dep) {
                scene.dependencies.push(dep.to_string());
            }
        }
    }
    scene.modified_by = Some(agent);
}

fn asset_type_for(tool: &str, path: &str) -> &'static str {
    match tool {
        "create_sprite_frames" => "sprite_frames",
        "create_animation" => "animation",
        "create_tileset" => "tileset",
        _ => match path.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
            Some("png" | "jpg" | "jpeg" | "webp" | "svg") => "texture",
            Some("wav" | "ogg" | "mp3") => "audio",
            Some("gd") => "script",
            _ => "resource",
        },
    }
}

fn recovery_label(action: &RecoveryAction) -> &'static str {
    match action {
        RecoveryAction::Retry => "retry",
        RecoveryAction::RetryWithParams(_) => "retry_with_params",
        RecoveryAction::PrependAndRetry(_) => "prepend_and_retry",
        RecoveryAction::Abort => "abort",
    }
}

fn preview(data: Option<&Value>) -> String {
    let text = data.map(Value::to_string).unwrap_or_default();
    if text.chars().count() <= OBSERVATION_PREVIEW_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(OBSERVATION_PREVIEW_CHARS).collect();
    cut.push('…');
    cut
}
