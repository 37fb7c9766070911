//! 工具执行器
//!
//! ToolExecutor 是外部协作者（真正修改编辑器的一侧）的接口；TimedExecutor 对每次调用施加超时，
//! 超时转为 code = "TIMEOUT" 的失败结果，并输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

/// 超时结果使用的错误码
pub const TIMEOUT_CODE: &str = "TIMEOUT";

/// 一次工具调用（名称 + JSON 参数）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// 读取字符串参数
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// 工具执行结果：预期内的失败一律用 success = false 表达，不抛错
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub message: String,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            code: "OK".to_string(),
            data: Some(data),
            message: String::new(),
            recoverable: true,
            duration_ms: None,
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: code.into(),
            data: None,
            message: message.into(),
            recoverable: true,
            duration_ms: None,
        }
    }

    pub fn unrecoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

/// 外部工具执行器：必须对可重试的工具幂等安全
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, params: Value) -> ToolResult;
}

/// 带超时与审计日志的执行器包装
pub struct TimedExecutor {
    inner: Arc<dyn ToolExecutor>,
    timeout: Duration,
}

impl TimedExecutor {
    pub fn new(inner: Arc<dyn ToolExecutor>, timeout_ms: u64) -> Self {
        Self {
            inner,
            timeout: Duration::from_millis(timeout_ms.max(1)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行工具；超时返回 TIMEOUT 失败结果；输出 JSON 审计日志
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let args_preview = args_preview(&call.params);
        let result = timeout(
            self.timeout,
            self.inner.execute(&call.name, call.params.clone()),
        )
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut result = match result {
            Ok(r) => r,
            Err(_) => ToolResult::failure(
                TIMEOUT_CODE,
                format!(
                    "Tool '{}' timed out after {}ms",
                    call.name,
                    self.timeout.as_millis()
                ),
            ),
        };
        result.duration_ms.get_or_insert(duration_ms);

        let outcome = if result.success {
            "ok"
        } else if result.code == TIMEOUT_CODE {
            "timeout"
        } else {
            "error"
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "ok": result.success,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
