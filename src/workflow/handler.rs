//! 后台运行句柄
//!
//! `spawn_workflow` 在 tokio 任务中运行一个 Agent，返回句柄：
//! 进度事件流（只能取走一次）、取消、以及 `await` 句柄得到最终输出。
//! 超时只约束产出 AgentOutput 的阶段；流式 token 的消费不计入。
//! 句柄在运行结束前被丢弃时会取消运行。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::workflow::{AgentOutput, AgentWorkflow, EventSink, EventStream};

pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 360;

pub struct WorkflowHandler {
    events: Option<EventStream>,
    cancel: CancellationToken,
    join: JoinHandle<Result<AgentOutput, AgentError>>,
}

pub fn spawn_workflow(
    agent: Arc<dyn AgentWorkflow>,
    input: impl Into<String>,
    streaming: bool,
    timeout: Duration,
) -> WorkflowHandler {
    let input = input.into();
    let (sink, events) = EventSink::channel();
    let cancel = CancellationToken::new();
    let child = cancel.clone();

    let join = tokio::spawn(async move {
        let run = agent.execute(&input, streaming, &sink, &child);
        tokio::select! {
            _ = child.cancelled() => Err(AgentError::Cancelled),
            res = tokio::time::timeout(timeout, run) => match res {
                Ok(output) => output,
                Err(_) => {
                    child.cancel();
                    tracing::warn!(agent = %agent.name(), timeout_secs = timeout.as_secs(), "workflow timed out");
                    Err(AgentError::WorkflowTimeout(timeout.as_secs()))
                }
            },
        }
    });

    WorkflowHandler {
        events: Some(events),
        cancel,
        join,
    }
}

impl WorkflowHandler {
    /// 取走进度事件流；第二次调用返回 None
    pub fn stream_events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Future for WorkflowHandler {
    type Output = Result<AgentOutput, AgentError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.join).poll(cx).map(|res| match res {
            Ok(output) => output,
            Err(e) if e.is_cancelled() => Err(AgentError::Cancelled),
            Err(e) => Err(AgentError::TaskJoin(e.to_string())),
        })
    }
}

impl Drop for WorkflowHandler {
    fn drop(&mut self) {
        if !self.join.is_finished() {
            self.cancel.cancel();
        }
    }
}
