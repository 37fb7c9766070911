//! 错误分类与恢复规划
//!
//! ErrorClassifier 把失败的工具结果归入一个类别（先看错误码，再看消息关键词；关键词只是近似），
//! RecoveryPlanner 据此给出恢复动作：原样重试、修正参数重试、前置修复调用后重试，或终止。

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::core::error::{ErrorCode, RecoveryAction};
use crate::tools::{ToolCall, ToolResult, TIMEOUT_CODE};

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 参数或路径不合法
    Validation,
    /// 工具自身失败
    Tool,
    /// 缺少前置条件（如没有打开场景）
    Context,
    /// 被控制的编辑器报告的错误
    External,
    Timeout,
    /// 用户取消或拒绝
    User,
}

impl ErrorCategory {
    /// 默认最大重试次数（不含首次尝试）
    pub fn max_retries(&self) -> u32 {
        match self {
            ErrorCategory::Validation | ErrorCategory::Tool | ErrorCategory::Context => 2,
            ErrorCategory::External | ErrorCategory::Timeout => 1,
            ErrorCategory::User => 0,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            ErrorCategory::Validation => ErrorCode::Validation,
            ErrorCategory::Tool => ErrorCode::ToolFailure,
            ErrorCategory::Context => ErrorCode::MissingContext,
            ErrorCategory::External => ErrorCode::ExternalError,
            ErrorCategory::Timeout => ErrorCode::Timeout,
            ErrorCategory::User => ErrorCode::Cancelled,
        }
    }

    fn suggested_action(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "Fix the parameter values (paths must start with res://)",
            ErrorCategory::Tool => "Retry the tool; if it keeps failing, try a different approach",
            ErrorCategory::Context => "Open the target scene first, then retry",
            ErrorCategory::External => "Check the editor output panel for the underlying error",
            ErrorCategory::Timeout => "The editor did not answer in time; retry when it is idle",
            ErrorCategory::User => "The operation was cancelled; nothing to do",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub category: ErrorCategory,
    pub code: ErrorCode,
    pub max_retries: u32,
    pub suggested_action: String,
}

impl Classification {
    pub fn of(category: ErrorCategory) -> Self {
        Self {
            category,
            code: category.error_code(),
            max_retries: category.max_retries(),
            suggested_action: category.suggested_action().to_string(),
        }
    }
}

const CONTEXT_HINTS: &[&str] = &[
    "no scene",
    "no open scene",
    "scene not open",
    "not open",
    "no edited scene",
    "no root",
];
const VALIDATION_HINTS: &[&str] = &["invalid", "malformed", "must start with", "missing param", "bad path"];
const EXTERNAL_HINTS: &[&str] = &["parse error", "script error", "engine", "editor reported"];
const USER_HINTS: &[&str] = &["cancel", "denied", "rejected by user"];

#[derive(Debug, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// 纯函数：仅依据错误码与消息内容分类
    pub fn classify_error(&self, result: &ToolResult, tool_name: &str) -> Classification {
        let category = Self::category_from_code(&result.code)
            .unwrap_or_else(|| Self::category_from_message(&result.message));
        tracing::debug!(tool = tool_name, code = %result.code, ?category, "Classified tool failure");
        Classification::of(category)
    }

    fn category_from_code(code: &str) -> Option<ErrorCategory> {
        let category = match code.to_ascii_uppercase().as_str() {
            TIMEOUT_CODE => ErrorCategory::Timeout,
            "VALIDATION" | "INVALID_PARAMS" | "INVALID_PATH" => ErrorCategory::Validation,
            "NO_SCENE" | "NOT_FOUND" | "MISSING_CONTEXT" => ErrorCategory::Context,
            "CANCELLED" | "DENIED" => ErrorCategory::User,
            "EXTERNAL" | "ENGINE_ERROR" => ErrorCategory::External,
            _ => return None,
        };
        Some(category)
    }

    fn category_from_message(message: &str) -> ErrorCategory {
        let lower = message.to_lowercase();
        let has = |hints: &[&str]| hints.iter().any(|h| lower.contains(h));
        if has(USER_HINTS) {
            ErrorCategory::User
        } else if lower.contains("timed out") || lower.contains("timeout") {
            ErrorCategory::Timeout
        } else if has(CONTEXT_HINTS) {
            ErrorCategory::Context
        } else if has(VALIDATION_HINTS) {
            ErrorCategory::Validation
        } else if has(EXTERNAL_HINTS) {
            ErrorCategory::External
        } else {
            ErrorCategory::Tool
        }
    }
}

/// 恢复计划
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPlan {
    pub action: RecoveryAction,
    /// 终止时展示给用户的消息
    pub user_message: String,
    pub reason: String,
}

impl RecoveryPlan {
    fn abort(user_message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: RecoveryAction::Abort,
            user_message: user_message.into(),
            reason: reason.into(),
        }
    }

    fn with(action: RecoveryAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            user_message: String::new(),
            reason: reason.into(),
        }
    }
}

fn resource_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"res://[^\s'"]+"#).unwrap())
}

const PATH_PARAMS: &[&str] = &["path", "scene_path"];

/// 规范化资源路径；无法修正时返回 None
pub fn normalize_resource_path(path: &str) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    let unified = trimmed.replace('\\', "/");
    let rest = unified
        .strip_prefix("res://")
        .or_else(|| unified.strip_prefix("res:/"))
        .unwrap_or(&unified)
        .trim_start_matches('/');
    let mut collapsed = String::with_capacity(rest.len());
    for segment in rest.split('/').filter(|s| !s.is_empty()) {
        if !collapsed.is_empty() {
            collapsed.push('/');
        }
        collapsed.push_str(segment);
    }
    if collapsed.is_empty() {
        return None;
    }
    Some(format!("res://{collapsed}"))
}

#[derive(Debug, Default)]
pub struct RecoveryPlanner;

impl RecoveryPlanner {
    pub fn new() -> Self {
        Self
    }

    /// attempt_count 为已失败的次数（首次失败为 1）；达到 max_retries 后不再重试
    pub fn generate_recovery_plan(
        &self,
        call: &ToolCall,
        result: &ToolResult,
        attempt_count: u32,
        classification: &Classification,
    ) -> RecoveryPlan {
        if attempt_count > classification.max_retries {
            return RecoveryPlan::abort(
                format!(
                    "{} failed after {} attempt(s): {}. {}",
                    call.name, attempt_count, result.message, classification.suggested_action
                ),
                "retry budget exhausted",
            );
        }

        match classification.category {
            ErrorCategory::Validation => match Self::repair_paths(&call.params) {
                Some(params) => RecoveryPlan::with(
                    RecoveryAction::RetryWithParams(params),
                    "rewrote malformed resource path",
                ),
                None => RecoveryPlan::abort(
                    format!("{}: {}. {}", call.name, result.message, classification.suggested_action),
                    "validation failure without an automatic fix",
                ),
            },
            ErrorCategory::Context => {
                let fix = match Self::scene_for(call, result) {
                    Some(scene) => ToolCall::new("open_scene", json!({ "path": scene })),
                    None => ToolCall::new("get_scene_tree", json!({})),
                };
                RecoveryPlan::with(
                    RecoveryAction::PrependAndRetry(vec![fix]),
                    "missing precondition, prepending setup call",
                )
            }
            ErrorCategory::Tool | ErrorCategory::External | ErrorCategory::Timeout => {
                RecoveryPlan::with(RecoveryAction::Retry, "transient failure")
            }
            ErrorCategory::User => RecoveryPlan::abort(
                format!("{} was cancelled: {}", call.name, result.message),
                "cancelled by user",
            ),
        }
    }

    /// 修正路径参数；没有任何参数被修改时返回 None
    fn repair_paths(params: &Value) -> Option<Value> {
        let mut fixed = params.clone();
        let obj = fixed.as_object_mut()?;
        let mut changed = false;
        for key in PATH_PARAMS {
            if let Some(Value::String(path)) = obj.get(*key) {
                if let Some(normalized) = normalize_resource_path(path) {
                    if normalized != *path {
                        obj.insert(key.to_string(), Value::String(normalized));
                        changed = true;
                    }
                }
            }
        }
        changed.then_some(fixed)
    }

    /// 需要打开的场景：优先取调用参数，其次取错误消息里的 res:// 路径
    fn scene_for(call: &ToolCall, result: &ToolResult) -> Option<String> {
        call.param_str("scene_path")
            .map(str::to_string)
            .or_else(|| {
                resource_regex()
                    .find(&result.message)
                    .map(|m| m.as_str().trim_end_matches(['.', ',', ')']).to_string())
            })
            .filter(|p| p.ends_with(".tscn") || p.ends_with(".scn"))
            .or_else(|| {
                call.param_str("path")
                    .filter(|p| p.ends_with(".tscn"))
                    .map(str::to_string)
            })
    }
}
