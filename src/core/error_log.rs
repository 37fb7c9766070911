//! 工具失败日志：有上限的环形缓冲，供编排器查询最近失败与各工具失败率

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::state::now_ms;

pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLogEntry {
    pub tool: String,
    pub params: Value,
    pub error_code: String,
    pub message: String,
    pub attempt: u32,
    pub timestamp: i64,
}

#[derive(Debug, Default, Clone, Copy)]
struct ToolStats {
    calls: u64,
    failures: u64,
}

/// 当前连续失败：同一工具、同一消息；该工具一次成功即清零
#[derive(Debug, Clone, PartialEq, Eq)]
struct Streak {
    tool: String,
    message: String,
    count: usize,
}

struct Inner {
    entries: VecDeque<ErrorLogEntry>,
    stats: HashMap<String, ToolStats>,
    streak: Option<Streak>,
}

pub struct ErrorLogger {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl ErrorLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                stats: HashMap::new(),
                streak: None,
            }),
            capacity: capacity.max(1),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// 记录一次调用（成功或失败都计数，用于失败率）
    pub fn record_call(&self, tool: &str, success: bool) {
        self.with_inner(|inner| {
            let stats = inner.stats.entry(tool.to_string()).or_default();
            stats.calls += 1;
            if !success {
                stats.failures += 1;
            } else if inner.streak.as_ref().is_some_and(|s| s.tool == tool) {
                inner.streak = None;
            }
        });
    }

    pub fn record_failure(
        &self,
        tool: &str,
        params: &Value,
        error_code: &str,
        message: &str,
        attempt: u32,
    ) {
        let entry = ErrorLogEntry {
            tool: tool.to_string(),
            params: params.clone(),
            error_code: error_code.to_string(),
            message: message.to_string(),
            attempt,
            timestamp: now_ms(),
        };
        tracing::warn!(tool, error_code, attempt, message, "Tool failure recorded");
        self.with_inner(|inner| {
            let repeated = inner
                .streak
                .as_ref()
                .is_some_and(|s| s.tool == tool && s.message == message);
            if repeated {
                if let Some(s) = inner.streak.as_mut() {
                    s.count += 1;
                }
            } else {
                inner.streak = Some(Streak {
                    tool: tool.to_string(),
                    message: message.to_string(),
                    count: 1,
                });
            }
            inner.entries.push_back(entry);
            while inner.entries.len() > self.capacity {
                inner.entries.pop_front();
            }
        });
    }

    /// 最近 n 条，最新的在最后
    pub fn recent(&self, n: usize) -> Vec<ErrorLogEntry> {
        self.with_inner(|inner| {
            let skip = inner.entries.len().saturating_sub(n);
            inner.entries.iter().skip(skip).cloned().collect()
        })
    }

    /// 某工具的失败率（无调用记录时为 0）
    pub fn failure_rate(&self, tool: &str) -> f64 {
        self.with_inner(|inner| match inner.stats.get(tool) {
            Some(s) if s.calls > 0 => s.failures as f64 / s.calls as f64,
            _ => 0.0,
        })
    }

    /// 最近的连续失败是否都是同一工具、同一消息且达到阈值；中间有该工具的成功调用则不算
    pub fn is_failure_loop(&self, tool: &str, message: &str, threshold: usize) -> bool {
        if threshold == 0 {
            return false;
        }
        self.with_inner(|inner| {
            inner
                .streak
                .as_ref()
                .is_some_and(|s| s.tool == tool && s.message == message && s.count >= threshold)
        })
    }

    pub fn len(&self) -> usize {
        self.with_inner(|inner| inner.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ErrorLogger {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_LOG_CAPACITY)
    }
}
