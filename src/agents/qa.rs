//! 质量检查 Agent
//!
//! 运行一组相互独立的检查（项目配置错误、运行时错误、资源存在性、场景图健全性），
//! 汇总为按严重级别分类的问题列表。没有 critical / error 级问题才算通过；每个问题都附带修复建议。

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::AgentsSection;
use crate::core::context::CoordinatorContext;
use crate::core::error::{AgentError, ErrorCode};
use crate::state::{AgentState, AgentStatus, SceneState};
use crate::tools::catalog::QA_TOOLS;
use crate::tools::ToolCall;
use crate::workflow::{AgentResult, AgentTask, TaskType};

use super::{Agent, AgentConfig, AgentRole, AgentRuntime};

pub const QA_AGENT_ID: &str = "qa";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
}

impl Severity {
    /// critical / error 会让检查失败
    pub fn is_blocking(&self) -> bool {
        matches!(self, Severity::Critical | Severity::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub check: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub suggestion: String,
}

impl ValidationIssue {
    pub fn new(check: &str, severity: Severity, message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            severity,
            message: message.into(),
            resource: None,
            suggestion: suggestion.into(),
        }
    }

    pub fn on(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// 单项检查；工具调用经 AgentRuntime 执行，受同样的权限与恢复策略约束
#[async_trait]
pub trait ValidationCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        scenes: &[SceneState],
        runtime: &AgentRuntime,
        ctx: &CoordinatorContext,
    ) -> Result<Vec<ValidationIssue>, AgentError>;
}

fn error_list(data: Option<&Value>) -> Vec<String> {
    data.and_then(|d| d.get("errors"))
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// 项目配置错误：解析失败 / 加载失败视为 critical
pub struct ConfigurationCheck;

#[async_trait]
impl ValidationCheck for ConfigurationCheck {
    fn name(&self) -> &str {
        "configuration"
    }

    async fn run(
        &self,
        _scenes: &[SceneState],
        runtime: &AgentRuntime,
        ctx: &CoordinatorContext,
    ) -> Result<Vec<ValidationIssue>, AgentError> {
        let outcome = runtime
            .invoke(ctx, ToolCall::new("get_project_errors", json!({})))
            .await?;
        Ok(error_list(outcome.result.data.as_ref())
            .into_iter()
            .map(|message| {
                let lower = message.to_lowercase();
                let severity = if lower.contains("parse") || lower.contains("failed to load") {
                    Severity::Critical
                } else {
                    Severity::Error
                };
                ValidationIssue::new(
                    self.name(),
                    severity,
                    message,
                    "Fix the reported project setting or resource and reload the project",
                )
            })
            .collect())
    }
}

/// 运行时错误输出
pub struct RuntimeErrorCheck;

#[async_trait]
impl ValidationCheck for RuntimeErrorCheck {
    fn name(&self) -> &str {
        "runtime_errors"
    }

    async fn run(
        &self,
        _scenes: &[SceneState],
        runtime: &AgentRuntime,
        ctx: &CoordinatorContext,
    ) -> Result<Vec<ValidationIssue>, AgentError> {
        let outcome = runtime
            .invoke(ctx, ToolCall::new("get_runtime_errors", json!({})))
            .await?;
        Ok(error_list(outcome.result.data.as_ref())
            .into_iter()
            .map(|message| {
                ValidationIssue::new(
                    self.name(),
                    Severity::Error,
                    message,
                    "Run the scene and fix the script error at the reported location",
                )
            })
            .collect())
    }
}

/// 场景引用的资源必须存在
pub struct ResourceExistenceCheck;

#[async_trait]
impl ValidationCheck for ResourceExistenceCheck {
    fn name(&self) -> &str {
        "resource_existence"
    }

    async fn run(
        &self,
        scenes: &[SceneState],
        runtime: &AgentRuntime,
        ctx: &CoordinatorContext,
    ) -> Result<Vec<ValidationIssue>, AgentError> {
        let mut issues = Vec::new();
        let mut checked: HashMap<String, bool> = HashMap::new();
        for scene in scenes {
            for dep in &scene.dependencies {
                let exists = match checked.get(dep) {
                    Some(exists) => *exists,
                    None => {
                        let outcome = runtime
                            .invoke(ctx, ToolCall::new("validate_resource", json!({ "path": dep })))
                            .await?;
                        let exists = outcome
                            .result
                            .data
                            .as_ref()
                            .and_then(|d| d.get("exists"))
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        checked.insert(dep.clone(), exists);
                        exists
                    }
                };
                if !exists {
                    issues.push(
                        ValidationIssue::new(
                            self.name(),
                            Severity::Error,
                            format!("{} references missing resource {}", scene.path, dep),
                            format!("Import {dep} or remove the reference from {}", scene.path),
                        )
                        .on(dep.clone()),
                    );
                }
            }
        }
        Ok(issues)
    }
}

/// 场景图健全性：只读取 ProjectState，不调用工具
pub struct SceneGraphCheck;

#[async_trait]
impl ValidationCheck for SceneGraphCheck {
    fn name(&self) -> &str {
        "scene_graph"
    }

    async fn run(
        &self,
        scenes: &[SceneState],
        _runtime: &AgentRuntime,
        _ctx: &CoordinatorContext,
    ) -> Result<Vec<ValidationIssue>, AgentError> {
        Ok(scenes.iter().flat_map(|s| scene_graph_issues(self.name(), s)).collect())
    }
}

fn scene_graph_issues(check: &str, scene: &SceneState) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if scene.root_type.is_none() {
        issues.push(
            ValidationIssue::new(
                check,
                Severity::Critical,
                format!("{} has no root node", scene.path),
                "Recreate the scene with a root node type",
            )
            .on(scene.path.clone()),
        );
    }
    if scene.nodes.is_empty() {
        issues.push(
            ValidationIssue::new(
                check,
                Severity::Info,
                format!("{} contains only its root node", scene.path),
                "Add child nodes if the scene is meant to hold content",
            )
            .on(scene.path.clone()),
        );
    }

    let names: HashSet<&str> = scene.nodes.iter().map(|n| n.name.as_str()).collect();
    let mut seen = HashSet::new();
    for node in &scene.nodes {
        if let Some(parent) = &node.parent {
            if !names.contains(parent.as_str()) {
                issues.push(
                    ValidationIssue::new(
                        check,
                        Severity::Error,
                        format!("{}: node {} has missing parent {}", scene.path, node.name, parent),
                        format!("Reparent {} under an existing node", node.name),
                    )
                    .on(scene.path.clone()),
                );
            }
        }
        if !seen.insert(node.name.as_str()) {
            issues.push(
                ValidationIssue::new(
                    check,
                    Severity::Warning,
                    format!("{}: duplicate node name {}", scene.path, node.name),
                    format!("Rename one of the {} nodes", node.name),
                )
                .on(scene.path.clone()),
            );
        }
    }
    issues
}

pub struct QaAgent {
    runtime: AgentRuntime,
    checks: Vec<Box<dyn ValidationCheck>>,
}

impl QaAgent {
    pub fn new(settings: &AgentsSection) -> Self {
        let config = AgentConfig::new(QA_AGENT_ID, "QA", AgentRole::Qa, settings)
            .with_goal("Find configuration, runtime, resource and scene graph problems")
            .with_exclusive_tools(QA_TOOLS)
            .with_keywords(&["validate", "verify", "check", "test", "qa", "errors"]);
        Self {
            runtime: AgentRuntime::new(config),
            checks: vec![
                Box::new(ConfigurationCheck),
                Box::new(RuntimeErrorCheck),
                Box::new(ResourceExistenceCheck),
                Box::new(SceneGraphCheck),
            ],
        }
    }

    pub fn with_check(mut self, check: Box<dyn ValidationCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// 检查范围：任务输入的 scenes 列表；未给出时为 ProjectState 中的全部场景
    async fn scenes_in_scope(task: &AgentTask, ctx: &CoordinatorContext) -> Vec<SceneState> {
        let all = ctx.state.get_state().await.scenes;
        let wanted: Option<HashSet<&str>> = task
            .input
            .get("scenes")
            .and_then(Value::as_array)
            .map(|paths| paths.iter().filter_map(Value::as_str).collect());
        all.into_values()
            .filter(|s| wanted.as_ref().map_or(true, |w| w.contains(s.path.as_str())))
            .collect()
    }
}

#[async_trait]
impl Agent for QaAgent {
    fn config(&self) -> &AgentConfig {
        self.runtime.config()
    }

    fn handled_task_types(&self) -> &[TaskType] {
        &[TaskType::Validation]
    }

    async fn execute(&self, task: &AgentTask, ctx: &CoordinatorContext) -> AgentResult {
        let _slot = self.runtime.occupy().await;
        let started = Instant::now();
        self.runtime.begin_task(ctx, task).await;
        let scenes = Self::scenes_in_scope(task, ctx).await;
        self.runtime.set_status(ctx, AgentStatus::Executing, 0.1).await;

        let mut issues = Vec::new();
        for (i, check) in self.checks.iter().enumerate() {
            match check.run(&scenes, &self.runtime, ctx).await {
                Ok(found) => issues.extend(found),
                Err(e) => issues.push(ValidationIssue::new(
                    check.name(),
                    Severity::Error,
                    format!("Check could not run: {}", e.message),
                    e.suggested_action,
                )),
            }
            let progress = 0.1 + 0.8 * (i + 1) as f32 / self.checks.len() as f32;
            self.runtime.set_status(ctx, AgentStatus::Executing, progress).await;
        }

        self.runtime.set_status(ctx, AgentStatus::Verifying, 0.9).await;
        issues.sort_by_key(|i| i.severity);
        let blocking = issues.iter().filter(|i| i.severity.is_blocking()).count();
        tracing::info!(
            agent = %self.runtime.config().id,
            scenes = scenes.len(),
            issues = issues.len(),
            blocking,
            "Validation finished"
        );

        let issues_json = json!(issues);
        if blocking == 0 {
            let result = AgentResult::success(task.id.clone(), self.runtime.config().id.clone())
                .with_output("issues", issues_json)
                .with_output("scenesChecked", json!(scenes.len()));
            return self.runtime.finish_success(ctx, result, 0, started).await;
        }

        let error = AgentError::new(ErrorCode::Validation, format!("{blocking} blocking issue(s) found"))
            .with_suggestion(issues[0].suggestion.clone());
        let mut result = self
            .runtime
            .finish_failure(ctx, task, error, Vec::new(), 0, started)
            .await;
        result.output.insert("issues".into(), issues_json);
        result.output.insert("scenesChecked".into(), json!(scenes.len()));
        result
    }

    async fn status(&self) -> AgentState {
        self.runtime.status().await
    }
}
