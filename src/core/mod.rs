//! 核心编排层：上下文、错误与恢复、阶段状态机、会话监管、任务调度、编排器与构建器

pub mod builder;
pub mod context;
pub mod error;
pub mod error_log;
pub mod events;
pub mod orchestrator;
pub mod phase;
pub mod recovery;
pub mod session_supervisor;
pub mod task_scheduler;

pub use builder::CoordinatorBuilder;
pub use context::{CoordinatorContext, ExecutionSettings};
pub use error::{AgentError, CoordinatorError, ErrorCode, RecoveryAction};
pub use error_log::{ErrorLogEntry, ErrorLogger};
pub use events::{CoordinatorEvent, EventSink};
pub use orchestrator::{Orchestrator, ORCHESTRATOR_ID};
pub use phase::{OrchestratorPhase, PhaseTracker};
pub use recovery::{Classification, ErrorCategory, ErrorClassifier, RecoveryPlan, RecoveryPlanner};
pub use session_supervisor::SessionSupervisor;
pub use task_scheduler::{AgentPermit, TaskScheduler};
