//! Agent 错误类型
//!
//! 工具解析/执行错误在派发处就地转为 error ToolOutput，不会冒泡到 Agent 循环；
//! 其余错误（LLM 故障、超时、编排器内部错误）对当前请求是致命的，由 HTTP 边界转成 500。

use thiserror::Error;

use crate::llm::LlmError;

/// Agent / 编排运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 工具名不存在（ToolResolutionError）
    #[error("Tool {0} does not exist")]
    ToolNotFound(String),

    /// 工具执行失败（ToolExecutionError）
    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 结构化预测输出不合法（PlanValidationError）
    #[error("Plan validation failed: {0}")]
    PlanValidation(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// 客户端断开或显式取消
    #[error("Cancelled")]
    Cancelled,

    #[error("Workflow timed out after {0}s")]
    WorkflowTimeout(u64),

    #[error("Required at least one agent to run chat engine")]
    NoAgents,

    #[error("Config error: {0}")]
    ConfigError(String),

    /// 后台运行任务 panic 或被中止
    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl AgentError {
    /// 是否属于「停止转发」类（取消 / 超时），而非真正的故障
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            AgentError::Cancelled | AgentError::Llm(LlmError::Cancelled)
        )
    }
}
