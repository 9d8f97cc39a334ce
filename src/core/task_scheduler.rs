//! 任务调度：工具并发池
//!
//! 同一批工具调用可并发执行，使用 Semaphore 限制同时运行的数量；
//! 获取许可时同时监听取消令牌，断开后不再排队等待。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

/// 任务调度器
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    /// 工具并发限制（默认 3）
    tool_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
        }
    }

    /// 获取工具执行许可；取消或信号量关闭时返回 Cancelled
    pub async fn acquire_tool(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, AgentError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            permit = self.tool_semaphore.clone().acquire_owned() => {
                permit.map_err(|_| AgentError::Cancelled)
            }
        }
    }

    pub fn available_permits(&self) -> usize {
        self.tool_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}
