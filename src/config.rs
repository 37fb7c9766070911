//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__COORDINATOR__MAX_PARALLEL_AGENTS=2`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub coordinator: CoordinatorSection,
    pub locks: LocksSection,
    pub tools: ToolsSection,
    pub agents: AgentsSection,
    pub recovery: RecoverySection,
    pub approval: ApprovalSection,
    pub sessions: SessionsSection,
}

/// [coordinator] 段：多 Agent 开关、并发上限、检查点与锁有效期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    /// 关闭时不拆分请求，整个请求交给编排 Agent 作为单个分析任务
    pub enabled: bool,
    pub max_parallel_agents: usize,
    pub enable_checkpoints: bool,
    pub max_checkpoints: usize,
    /// 锁默认有效期（毫秒）
    pub lock_timeout_ms: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_parallel_agents: 4,
            enable_checkpoints: true,
            max_checkpoints: 50,
            lock_timeout_ms: 300_000,
        }
    }
}

/// [locks] 段：过期锁清理周期与获取重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocksSection {
    pub reaper_interval_secs: u64,
    pub acquire_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for LocksSection {
    fn default() -> Self {
        Self {
            reaper_interval_secs: 60,
            acquire_retries: 3,
            retry_delay_ms: 250,
        }
    }
}

impl LocksSection {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// [tools] 段：单次工具调用超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub tool_timeout_ms: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_ms: 30_000,
        }
    }
}

/// [agents] 段：每个 Agent 的迭代 / token 预算与工作区根
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    pub max_iterations: u32,
    pub max_tokens: u64,
    pub workspace_root: String,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            max_tokens: 32_000,
            workspace_root: "res://".to_string(),
        }
    }
}

/// [recovery] 段：失败日志容量与重复失败判定阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub error_log_capacity: usize,
    pub failure_loop_threshold: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            error_log_capacity: 100,
            failure_loop_threshold: 3,
        }
    }
}

/// [approval] 段：人工审批等待时间与超时后的默认结果
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    pub timeout_secs: u64,
    pub default_on_timeout: bool,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            default_on_timeout: true,
        }
    }
}

/// [sessions] 段：消息日志上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    pub max_messages: usize,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self { max_messages: 1000 }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载失败时记录警告并使用默认配置
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert!(cfg.coordinator.enabled);
        assert_eq!(cfg.coordinator.max_parallel_agents, 4);
        assert!(cfg.coordinator.enable_checkpoints);
        assert_eq!(cfg.coordinator.max_checkpoints, 50);
        assert_eq!(cfg.coordinator.lock_timeout_ms, 300_000);
        assert_eq!(cfg.locks.reaper_interval(), Duration::from_secs(60));
        assert_eq!(cfg.recovery.error_log_capacity, 100);
    }

    #[test]
    fn test_file_overrides_some_keys() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[coordinator]\nmax_parallel_agents = 2\nenabled = false\n\n[approval]\ntimeout_secs = 5"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.coordinator.max_parallel_agents, 2);
        assert!(!cfg.coordinator.enabled);
        // 未出现的键保持默认
        assert_eq!(cfg.coordinator.max_checkpoints, 50);
        assert_eq!(cfg.approval.timeout_secs, 5);
        assert!(cfg.approval.default_on_timeout);
    }
}
