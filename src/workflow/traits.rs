//! 可运行的 Agent 工作流抽象
//!
//! 单 Agent、规划编排器、检索对话引擎都实现 AgentWorkflow；委托工具与 HTTP 层只依赖这个 trait。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::workflow::{AgentOutput, EventSink};

#[async_trait]
pub trait AgentWorkflow: Send + Sync {
    fn name(&self) -> &str;

    /// 供编排器选择 Agent 的描述
    fn description(&self) -> &str {
        ""
    }

    /// 运行一次任务。进度事件写入 `events`（子工作流拿到的是父级通道，事件直接冒泡）；
    /// `streaming` 为 true 时可返回尚未消费的 token 流。
    async fn execute(
        &self,
        input: &str,
        streaming: bool,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, AgentError>;

    /// 记忆独立的副本，供同一 Agent 被多个子任务并发调用时使用；无运行状态时返回 None
    async fn fork_for_run(&self) -> Option<Arc<dyn AgentWorkflow>> {
        None
    }
}
