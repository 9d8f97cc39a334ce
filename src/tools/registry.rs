//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），
//! 由 ToolRegistry 按名注册与查找；ToolExecutor 在派发时加超时并把失败统一转为 error ToolOutput。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::workflow::EventSink;

/// 工具元数据（供 LLM 选择工具）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    /// 参数 JSON Schema
    pub parameters: Value,
}

/// 工具调用上下文：父级事件通道（委托子 Agent 时用于事件冒泡）与取消令牌
#[derive(Clone, Default)]
pub struct ToolContext {
    pub events: EventSink,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(events: EventSink, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }
}

/// 工具执行返回：文本内容 + 原始输出（如检索节点）
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub content: String,
    pub raw_output: Value,
}

impl ToolResponse {
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            raw_output: Value::String(content.clone()),
            content,
        }
    }

    pub fn with_raw(content: impl Into<String>, raw_output: Value) -> Self {
        Self {
            content: content.into(),
            raw_output,
        }
    }
}

/// 一次工具调用的结果；写入对话为 tool 消息，成功结果同时计入本次运行的 sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_name: String,
    pub call_id: String,
    pub content: String,
    pub raw_output: Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(tool_name: &str, call_id: &str, response: ToolResponse) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            call_id: call_id.to_string(),
            content: response.content,
            raw_output: response.raw_output,
            is_error: false,
        }
    }

    pub fn error(tool_name: &str, call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            call_id: call_id.to_string(),
            content: content.into(),
            raw_output: Value::Null,
            is_error: true,
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（tool call 中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    /// 默认返回空对象，表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }

    /// 执行工具
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResponse, String>;

    /// 是否受执行器的单次调用超时约束；委托子 Agent 的工具只受整体工作流超时与取消约束
    fn uses_call_timeout(&self) -> bool {
        true
    }

    /// 为一次并发运行复制出状态独立的实例；无运行状态的工具返回 None，直接共享
    async fn fork_for_run(&self) -> Option<Arc<dyn Tool>> {
        None
    }
}

/// 工具注册表：保持注册顺序（工具目录文本稳定），按名称查找
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tools(tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        let mut registry = Self::new();
        for tool in tools {
            registry.register_arc(tool);
        }
        registry
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    /// 同名工具后注册者覆盖先注册者
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&i) => self.tools[i] = tool,
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&i| Arc::clone(&self.tools[i]))
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn metadata(&self) -> Vec<ToolMetadata> {
        self.tools.iter().map(|t| t.metadata()).collect()
    }

    /// 工具目录文本：每行 `name: description`，用于规划 prompt
    pub fn catalog(&self) -> String {
        self.tools
            .iter()
            .map(|t| format!("{}: {}\n", t.name(), t.description()))
            .collect()
    }

    /// 复制注册表：有运行状态的工具各自 fork，其余共享同一实例
    pub async fn fork_for_run(&self) -> Self {
        let mut tools = Vec::with_capacity(self.tools.len());
        for tool in &self.tools {
            let forked = tool.fork_for_run().await;
            tools.push(forked.unwrap_or_else(|| Arc::clone(tool)));
        }
        Self {
            tools,
            index: self.index.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            self.1
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResponse, String> {
            Ok(ToolResponse::text(self.1))
        }
    }

    #[test]
    fn test_catalog_keeps_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Named("b", "second"));
        registry.register(Named("a", "first"));
        assert_eq!(registry.catalog(), "b: second\na: first\n");
        assert_eq!(registry.tool_names(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Named("x", "old"));
        registry.register(Named("x", "new"));
        assert_eq!(registry.len(), 1);
        let tool = registry.get("x").unwrap();
        let out = tool.execute(Value::Null, &ToolContext::default()).await.unwrap();
        assert_eq!(out.content, "new");
    }

    #[test]
    fn test_error_output_is_flagged() {
        let out = ToolOutput::error("x", "call_1", "boom");
        assert!(out.is_error);
        assert_eq!(out.call_id, "call_1");
        assert_eq!(out.raw_output, Value::Null);
    }
}
