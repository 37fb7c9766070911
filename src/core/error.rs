//! 错误类型与恢复动作
//!
//! AgentError 是任务失败时随 AgentResult 返回的机器可读错误；RecoveryAction 由 RecoveryPlanner 产出，
//! 决定重试、改参重试、前置修复调用或终止。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tools::ToolCall;
use crate::workflow::PlanError;

/// 错误分类（对外稳定的 snake_case 代码）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    ToolFailure,
    MissingContext,
    ExternalError,
    Timeout,
    Cancelled,
    PreconditionFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::ToolFailure => "tool_failure",
            ErrorCode::MissingContext => "missing_context",
            ErrorCode::ExternalError => "external_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::PreconditionFailed => "precondition_failed",
        }
    }

    /// 该类错误在调用方换个时机或参数后是否可能成功
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorCode::Cancelled | ErrorCode::Validation)
    }

    fn default_action(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "Check the tool parameters and resource paths",
            ErrorCode::ToolFailure => "Retry the operation or use an alternative tool",
            ErrorCode::MissingContext => "Open or create the required scene before retrying",
            ErrorCode::ExternalError => "Inspect the editor output for errors",
            ErrorCode::Timeout => "Retry once the editor is responsive",
            ErrorCode::Cancelled => "No action required",
            ErrorCode::PreconditionFailed => "Wait for the conflicting operation to finish",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务级失败：随 AgentResult 返回给编排器与调用方
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{code}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct AgentError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    pub suggested_action: String,
}

impl AgentError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable: code.is_recoverable(),
            suggested_action: code.default_action().to_string(),
        }
    }

    pub fn with_suggestion(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = action.into();
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PreconditionFailed, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }
}

/// 构建与管理操作中的错误
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("No agents registered")]
    NoAgents,

    #[error("Duplicate agent id: {0}")]
    DuplicateAgent(String),

    #[error("Planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// 恢复规划给出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 原样重试
    Retry,
    /// 用修正后的参数重试
    RetryWithParams(serde_json::Value),
    /// 先执行修复调用（如打开场景），再重试原调用
    PrependAndRetry(Vec<ToolCall>),
    /// 终止并向用户展示消息
    Abort,
}

impl RecoveryAction {
    pub fn is_retry(&self) -> bool {
        !matches!(self, RecoveryAction::Abort)
    }
}
