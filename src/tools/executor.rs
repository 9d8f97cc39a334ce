//! 工具执行器
//!
//! 持有 ToolRegistry、单次调用超时与并发池。dispatch 并发执行一批 tool call，
//! 按调用顺序返回结果；工具不存在、执行失败、超时、panic、取消全部就地转为 error ToolOutput，
//! 不会向 Agent 循环抛错。每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::{AgentError, TaskScheduler};
use crate::memory::ToolCall;
use crate::tools::{Tool, ToolContext, ToolMetadata, ToolOutput, ToolRegistry};

/// 工具执行失败时写入对话的前缀
pub const TOOL_ERROR_PREFIX: &str = "Encountered error in tool call: ";

/// 工具执行器：对每次调用施加超时与并发限制，并把失败映射为 error 输出
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
    scheduler: TaskScheduler,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            scheduler: TaskScheduler::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// 工具状态独立的副本（并发子任务各用一份）
    pub async fn fork_for_run(&self) -> Self {
        Self {
            registry: self.registry.fork_for_run().await,
            timeout: self.timeout,
            scheduler: self.scheduler.clone(),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn metadata(&self) -> Vec<ToolMetadata> {
        self.registry.metadata()
    }

    /// 执行单个调用
    pub async fn invoke(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let tool = self.registry.get(&call.tool_name);
        run_call(tool, call.clone(), ctx.clone(), self.timeout, self.scheduler.clone()).await
    }

    /// 同步形式：内部创建单线程运行时，不可在异步上下文中调用
    pub fn invoke_blocking(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt.block_on(self.invoke(call, ctx)),
            Err(e) => ToolOutput::error(
                &call.tool_name,
                &call.call_id,
                format!("{}{}", TOOL_ERROR_PREFIX, e),
            ),
        }
    }

    /// 并发执行一批调用（汇合点），结果按调用顺序返回，与完成顺序无关
    pub async fn dispatch(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolOutput> {
        let handles: Vec<_> = calls
            .iter()
            .map(|call| {
                let tool = self.registry.get(&call.tool_name);
                tokio::spawn(run_call(
                    tool,
                    call.clone(),
                    ctx.clone(),
                    self.timeout,
                    self.scheduler.clone(),
                ))
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .zip(calls)
            .map(|(joined, call)| {
                joined.unwrap_or_else(|e| {
                    let err = AgentError::TaskJoin(e.to_string());
                    audit(call, false, "panic", Duration::ZERO);
                    ToolOutput::error(
                        &call.tool_name,
                        &call.call_id,
                        format!("{}{}", TOOL_ERROR_PREFIX, err),
                    )
                })
            })
            .collect()
    }
}

async fn run_call(
    tool: Option<Arc<dyn Tool>>,
    call: ToolCall,
    ctx: ToolContext,
    limit: Duration,
    scheduler: TaskScheduler,
) -> ToolOutput {
    let start = Instant::now();
    let Some(tool) = tool else {
        audit(&call, false, "not_found", start.elapsed());
        let err = AgentError::ToolNotFound(call.tool_name.clone());
        return ToolOutput::error(&call.tool_name, &call.call_id, err.to_string());
    };

    let bounded = tool.uses_call_timeout();
    let result = match scheduler.acquire_tool(&ctx.cancel).await {
        Err(e) => Err(e),
        Ok(_permit) => {
            let execution = async {
                let fut = tool.execute(call.arguments.clone(), &ctx);
                if bounded {
                    timeout(limit, fut).await
                } else {
                    Ok(fut.await)
                }
            };
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
                res = execution => match res {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e)),
                    Err(_) => Err(AgentError::ToolTimeout(call.tool_name.clone())),
                },
            }
        }
    };

    match result {
        Ok(response) => {
            audit(&call, true, "ok", start.elapsed());
            ToolOutput::success(&call.tool_name, &call.call_id, response)
        }
        Err(e) => {
            let outcome = match e {
                AgentError::ToolTimeout(_) => "timeout",
                AgentError::Cancelled => "cancelled",
                _ => "error",
            };
            audit(&call, false, outcome, start.elapsed());
            let detail = match e {
                AgentError::ToolExecutionFailed(msg) => msg,
                other => other.to_string(),
            };
            ToolOutput::error(
                &call.tool_name,
                &call.call_id,
                format!("{}{}", TOOL_ERROR_PREFIX, detail),
            )
        }
    }
}

fn audit(call: &ToolCall, ok: bool, outcome: &str, elapsed: Duration) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": call.tool_name,
        "call_id": call.call_id,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": elapsed.as_millis() as u64,
        "args_preview": args_preview(&call.arguments),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
