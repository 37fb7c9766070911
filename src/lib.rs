//! Hive - Rust 多智能体任务协调引擎
//!
//! 模块划分：
//! - **agents**: Agent trait、通用执行循环、审批闸门与五个内置 Agent
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **coordination**: 资源锁与 Agent 间消息总线
//! - **core**: 编排器、阶段状态机、错误分类与恢复、会话监管、任务调度
//! - **llm**: 推理协作者接口与 Mock 实现
//! - **observability**: tracing 初始化
//! - **state**: 共享项目状态、检查点与回滚
//! - **tools**: 工具执行器、工具目录、模拟编辑器
//! - **workflow**: 任务类型、依赖图与 TaskPlanner

pub mod agents;
pub mod config;
pub mod coordination;
pub mod core;
pub mod llm;
pub mod observability;
pub mod state;
pub mod tools;
pub mod workflow;

pub use crate::core::{CoordinatorBuilder, CoordinatorEvent, Orchestrator, OrchestratorPhase};
pub use crate::workflow::{AgentResult, PlanRequest, TaskPlan};
