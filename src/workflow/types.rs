//! 工作流类型定义
//!
//! Agent 运行结果、子任务、计划、计划事件与派发策略

use std::fmt;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::Message;
use crate::tools::ToolOutput;

/// 单个 Agent 运行的终值
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRunResult {
    pub final_message: Message,
    /// 本次运行中成功的工具输出（引用 / 溯源）
    pub sources: Vec<ToolOutput>,
}

/// 流式文本增量；单次、只进，消费它才会驱动底层 LLM 流
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, AgentError>> + Send>>;

/// Agent 运行输出：完整消息，或尚未消费的 token 流
pub enum AgentOutput {
    Complete(AgentRunResult),
    Streaming {
        tokens: TokenStream,
        sources: Vec<ToolOutput>,
    },
}

impl AgentOutput {
    pub fn sources(&self) -> &[ToolOutput] {
        match self {
            AgentOutput::Complete(r) => &r.sources,
            AgentOutput::Streaming { sources, .. } => sources,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, AgentOutput::Streaming { .. })
    }

    /// 收集为完整结果（流式输出会被读完）
    pub async fn into_result(self) -> Result<AgentRunResult, AgentError> {
        match self {
            AgentOutput::Complete(r) => Ok(r),
            AgentOutput::Streaming { mut tokens, sources } => {
                let mut content = String::new();
                while let Some(token) = tokens.next().await {
                    content.push_str(&token?);
                }
                Ok(AgentRunResult {
                    final_message: Message::assistant(content),
                    sources,
                })
            }
        }
    }
}

impl fmt::Debug for AgentOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentOutput::Complete(r) => f.debug_tuple("Complete").field(r).finish(),
            AgentOutput::Streaming { sources, .. } => f
                .debug_struct("Streaming")
                .field("sources", &sources.len())
                .finish_non_exhaustive(),
        }
    }
}

impl From<AgentRunResult> for AgentOutput {
    fn from(r: AgentRunResult) -> Self {
        AgentOutput::Complete(r)
    }
}

/// 子任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SubTask {
    /// 计划内唯一的名称
    pub name: String,
    /// 交给执行 Agent 的输入
    pub input: String,
    /// 预期输出
    #[serde(default)]
    pub expected_output: String,
    /// 依赖的子任务名称（必须在同一计划内）
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SubTask {
    pub fn new(name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            expected_output: String::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = expected.into();
        self
    }

    pub fn with_dependencies<S: Into<String>>(mut self, deps: impl IntoIterator<Item = S>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// 计划：有序子任务列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    pub sub_tasks: Vec<SubTask>,
}

impl Plan {
    pub fn new(sub_tasks: Vec<SubTask>) -> Self {
        Self { sub_tasks }
    }

    pub fn names(&self) -> Vec<&str> {
        self.sub_tasks.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&SubTask> {
        self.sub_tasks.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanEventType {
    Created,
    Refined,
}

impl PlanEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanEventType::Created => "created",
            PlanEventType::Refined => "refined",
        }
    }
}

/// 计划事件文本：`Plan created: Let's do: a, b`
pub fn plan_event_message(kind: PlanEventType, plan: &Plan) -> String {
    format!("Plan {}: Let's do: {}", kind.as_str(), plan.names().join(", "))
}

/// 子任务派发策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// 每轮只派发第一个就绪子任务（执行 Agent 的记忆不会交错）
    #[default]
    FirstReady,
    /// 每轮并发派发全部就绪子任务，全部完成后再继续
    AllReady,
}
