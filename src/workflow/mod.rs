//! 任务规划：数据类型、依赖图、计划构建器与 TaskPlanner

pub mod builder;
pub mod graph;
pub mod planner;
pub mod types;

pub use builder::PlanBuilder;
pub use graph::TaskGraph;
pub use planner::{priority_for, CapabilityTable, PlanRequest, SubGoal, TaskPlanner};
pub use types::*;
