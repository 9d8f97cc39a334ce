//! 工作流层：单 Agent 工具循环、规划编排器、计划依赖图、进度事件与运行句柄

pub mod events;
pub mod graph;
pub mod handler;
pub mod orchestrator;
pub mod planner;
pub mod single;
pub mod traits;
pub mod types;

pub use events::{AgentRunEvent, EventSink, EventStream};
pub use graph::{ready_sub_tasks, remaining_sub_tasks, validate_plan, PlanError, PlanGraph};
pub use handler::{spawn_workflow, WorkflowHandler, DEFAULT_WORKFLOW_TIMEOUT_SECS};
pub use orchestrator::{StructuredPlannerAgent, EXECUTOR_SYSTEM_PROMPT};
pub use planner::{Planner, PlannerState};
pub use single::{FunctionCallingAgent, DEFAULT_MAX_TOOL_ITERATIONS};
pub use traits::AgentWorkflow;
pub use types::*;
