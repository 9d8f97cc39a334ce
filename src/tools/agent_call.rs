//! 委托工具：把一个子 Agent 包装成 `call_<name>` 工具
//!
//! 子 Agent 使用调用方的 EventSink 运行，其进度事件按产生顺序直接进入父级事件流，
//! 且都在本工具返回之前写入；子 Agent 最终消息的文本即工具输出。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::{input_schema, parse_args};
use crate::tools::{Tool, ToolContext, ToolResponse};
use crate::workflow::AgentWorkflow;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AgentCallArgs {
    /// 交给子 Agent 的任务描述
    pub input: String,
}

pub struct AgentCallTool {
    name: String,
    description: String,
    agent: Arc<dyn AgentWorkflow>,
}

impl AgentCallTool {
    pub fn new(agent: Arc<dyn AgentWorkflow>) -> Self {
        let name = format!("call_{}", agent.name());
        let mut description = format!(
            "Use this tool to delegate a sub task to the {} agent.",
            agent.name()
        );
        if !agent.description().is_empty() {
            description.push_str(&format!(" The agent is an {}.", agent.description()));
        }
        Self {
            name,
            description,
            agent,
        }
    }
}

#[async_trait]
impl Tool for AgentCallTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        input_schema::<AgentCallArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResponse, String> {
        let args: AgentCallArgs = parse_args(&self.name, args)?;
        let output = self
            .agent
            .execute(&args.input, false, &ctx.events, &ctx.cancel)
            .await
            .map_err(|e| e.to_string())?;
        let result = output.into_result().await.map_err(|e| e.to_string())?;
        Ok(ToolResponse::text(result.final_message.content))
    }

    fn uses_call_timeout(&self) -> bool {
        false
    }

    async fn fork_for_run(&self) -> Option<Arc<dyn Tool>> {
        let agent = self.agent.fork_for_run().await?;
        Some(Arc::new(Self {
            name: self.name.clone(),
            description: self.description.clone(),
            agent,
        }))
    }
}
