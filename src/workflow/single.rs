//! 单 Agent 状态机（function calling）
//!
//! `Prepare → Decide → (ToolDispatch → Decide)* → Done`
//!
//! - Prepare：补 system prompt、写入用户输入、发出 "Start to work on" 事件；
//! - Decide：带工具元数据调用 LLM。非流式直接得到消息；流式先看第一个有内容的 chunk，
//!   是 tool call 就读完整个响应，否则把剩余 chunk 作为惰性 token 流交给调用方；
//! - ToolDispatch：整批并发执行，结果按调用顺序写回对话后再回到 Decide；
//! - 工具轮数超过上限时以降级消息结束，避免 LLM 无休止地请求工具。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{ChatStream, LlmClient, LlmError};
use crate::memory::{ConversationMemory, Message, TokenBudget, ToolCall};
use crate::tools::{ToolContext, ToolExecutor, ToolOutput, ToolRegistry};
use crate::workflow::{AgentOutput, AgentRunResult, AgentWorkflow, EventSink, TokenStream};

/// 单次运行内最大工具轮数
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 20;

enum AgentState {
    Prepare,
    Decide,
    ToolDispatch(Vec<ToolCall>),
    Done(AgentOutput),
}

/// Function-calling Agent：持有自己的对话记忆，跨多次运行累积
pub struct FunctionCallingAgent {
    name: String,
    description: String,
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    system_prompt: Option<String>,
    memory: Arc<Mutex<ConversationMemory>>,
    write_events: bool,
    max_tool_iterations: usize,
}

impl FunctionCallingAgent {
    pub fn new(name: impl Into<String>, llm: Arc<dyn LlmClient>, executor: ToolExecutor) -> Self {
        let budget = TokenBudget::new(llm.context_window());
        Self {
            name: name.into(),
            description: String::new(),
            llm,
            executor,
            system_prompt: None,
            memory: Arc::new(Mutex::new(ConversationMemory::with_budget(budget))),
            write_events: true,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 以既有对话历史初始化记忆（构建阶段调用）
    pub fn with_history(self, history: impl IntoIterator<Item = Message>) -> Self {
        let memory = self
            .memory
            .try_lock()
            .map(|m| m.clone())
            .unwrap_or_default()
            .with_history(history);
        Self {
            memory: Arc::new(Mutex::new(memory)),
            ..self
        }
    }

    pub fn with_memory(mut self, memory: ConversationMemory) -> Self {
        self.memory = Arc::new(Mutex::new(memory));
        self
    }

    pub fn with_write_events(mut self, write_events: bool) -> Self {
        self.write_events = write_events;
        self
    }

    pub fn with_max_tool_iterations(mut self, max: usize) -> Self {
        self.max_tool_iterations = max.max(1);
        self
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn tools(&self) -> &ToolRegistry {
        self.executor.registry()
    }

    pub fn llm(&self) -> Arc<dyn LlmClient> {
        Arc::clone(&self.llm)
    }

    /// 当前对话快照
    pub async fn memory(&self) -> Vec<Message> {
        self.memory.lock().await.get()
    }

    /// 复制一个记忆独立的执行者（从当前对话快照开始），用于并发执行子任务
    pub async fn fork(&self) -> Self {
        let snapshot = self.memory.lock().await.clone();
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            llm: Arc::clone(&self.llm),
            executor: self.executor.fork_for_run().await,
            system_prompt: self.system_prompt.clone(),
            memory: Arc::new(Mutex::new(snapshot)),
            write_events: self.write_events,
            max_tool_iterations: self.max_tool_iterations,
        }
    }

    /// 把一次外部完成的问答写入对话（并发子任务汇合后同步到共享执行者）
    pub async fn record_exchange(&self, input: &str, answer: &Message) {
        let mut memory = self.memory.lock().await;
        memory.append(Message::user(input));
        memory.append(answer.clone());
    }

    fn emit(&self, events: &EventSink, message: impl Into<String>) {
        if self.write_events {
            events.emit(&self.name, message);
        }
    }

    /// 运行状态机
    pub async fn run(
        &self,
        input: &str,
        streaming: bool,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        let ctx = ToolContext::new(events.clone(), cancel.clone());
        let mut sources: Vec<ToolOutput> = Vec::new();
        let mut iterations = 0usize;
        let mut state = AgentState::Prepare;

        loop {
            state = match state {
                AgentState::Prepare => {
                    self.prepare(input, events).await;
                    AgentState::Decide
                }
                AgentState::Decide => {
                    if cancel.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                    if streaming {
                        self.decide_streaming(events, cancel, &mut sources).await?
                    } else {
                        self.decide(events, cancel, &mut sources).await?
                    }
                }
                AgentState::ToolDispatch(calls) => {
                    iterations += 1;
                    if iterations > self.max_tool_iterations {
                        AgentState::Done(self.give_up(events, &mut sources).await)
                    } else {
                        self.dispatch(&calls, &ctx, &mut sources).await;
                        AgentState::Decide
                    }
                }
                AgentState::Done(output) => return Ok(output),
            };
        }
    }

    async fn prepare(&self, input: &str, events: &EventSink) {
        {
            let mut memory = self.memory.lock().await;
            if let Some(prompt) = &self.system_prompt {
                memory.ensure_system(prompt);
            }
            memory.append(Message::user(input));
        }
        self.emit(events, format!("Start to work on: {}", input));
    }

    async fn decide(
        &self,
        events: &EventSink,
        cancel: &CancellationToken,
        sources: &mut Vec<ToolOutput>,
    ) -> Result<AgentState, AgentError> {
        let history = self.memory.lock().await.get();
        let tools = self.executor.metadata();
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            reply = self.llm.chat(&history, &tools) => reply?,
        };
        self.memory.lock().await.append(reply.clone());

        if reply.has_tool_calls() {
            return Ok(AgentState::ToolDispatch(reply.tool_calls));
        }
        self.emit(events, "Finished task");
        Ok(AgentState::Done(AgentOutput::Complete(AgentRunResult {
            final_message: reply,
            sources: std::mem::take(sources),
        })))
    }

    async fn decide_streaming(
        &self,
        events: &EventSink,
        cancel: &CancellationToken,
        sources: &mut Vec<ToolOutput>,
    ) -> Result<AgentState, AgentError> {
        let history = self.memory.lock().await.get();
        let tools = self.executor.metadata();
        let mut chunks = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            s = self.llm.chat_stream(&history, &tools) => s?,
        };

        // 跳过空 chunk，直到能判断是 tool call 还是文本
        let mut first = None;
        while let Some(chunk) = next_chunk(&mut chunks, cancel).await {
            let chunk = chunk?;
            if chunk.message.has_tool_calls() || !chunk.delta.is_empty() {
                first = Some(chunk);
                break;
            }
        }

        match first {
            Some(chunk) if chunk.message.has_tool_calls() => {
                let mut full = chunk.message;
                while let Some(chunk) = next_chunk(&mut chunks, cancel).await {
                    full = chunk?.message;
                }
                self.memory.lock().await.append(full.clone());
                Ok(AgentState::ToolDispatch(full.tool_calls))
            }
            first => {
                self.emit(events, "Finished task");
                let tokens = token_stream(
                    first.map(|c| c.delta),
                    chunks,
                    Arc::clone(&self.memory),
                    cancel.clone(),
                );
                Ok(AgentState::Done(AgentOutput::Streaming {
                    tokens,
                    sources: std::mem::take(sources),
                }))
            }
        }
    }

    async fn dispatch(&self, calls: &[ToolCall], ctx: &ToolContext, sources: &mut Vec<ToolOutput>) {
        let outputs = self.executor.dispatch(calls, ctx).await;
        let mut memory = self.memory.lock().await;
        for output in outputs {
            memory.append(Message::tool(
                output.content.clone(),
                output.call_id.clone(),
                output.tool_name.clone(),
            ));
            if !output.is_error {
                sources.push(output);
            }
        }
    }

    async fn give_up(&self, events: &EventSink, sources: &mut Vec<ToolOutput>) -> AgentOutput {
        tracing::warn!(
            agent = %self.name,
            max = self.max_tool_iterations,
            "tool iteration limit reached"
        );
        let mut memory = self.memory.lock().await;
        let last_output = memory
            .messages()
            .iter()
            .rev()
            .find(|m| !m.content.is_empty())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let message = Message::assistant(format!(
            "Reached the maximum number of tool iterations ({}). Last output:\n{}",
            self.max_tool_iterations, last_output
        ));
        memory.append(message.clone());
        drop(memory);
        self.emit(events, "Finished task");
        AgentOutput::Complete(AgentRunResult {
            final_message: message,
            sources: std::mem::take(sources),
        })
    }
}

pub(crate) async fn next_chunk(
    chunks: &mut ChatStream,
    cancel: &CancellationToken,
) -> Option<Result<crate::llm::ChatChunk, LlmError>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Some(Err(LlmError::Cancelled)),
        chunk = chunks.next() => chunk,
    }
}

struct TokenState {
    first: Option<String>,
    chunks: ChatStream,
    memory: Arc<Mutex<ConversationMemory>>,
    content: String,
    cancel: CancellationToken,
    finished: bool,
}

/// 惰性 token 流：读完时把完整的 assistant 消息写入记忆
pub(crate) fn token_stream(
    first: Option<String>,
    chunks: ChatStream,
    memory: Arc<Mutex<ConversationMemory>>,
    cancel: CancellationToken,
) -> TokenStream {
    let state = TokenState {
        first,
        chunks,
        memory,
        content: String::new(),
        cancel,
        finished: false,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        if let Some(delta) = state.first.take() {
            state.content.push_str(&delta);
            return Some((Ok(delta), state));
        }
        loop {
            match next_chunk(&mut state.chunks, &state.cancel).await {
                Some(Ok(chunk)) => {
                    if chunk.delta.is_empty() {
                        continue;
                    }
                    state.content.push_str(&chunk.delta);
                    return Some((Ok(chunk.delta), state));
                }
                Some(Err(LlmError::Cancelled)) => {
                    state.finished = true;
                    return Some((Err(AgentError::Cancelled), state));
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(AgentError::Llm(e)), state));
                }
                None => {
                    state
                        .memory
                        .lock()
                        .await
                        .append(Message::assistant(state.content.clone()));
                    return None;
                }
            }
        }
    }))
}

#[async_trait]
impl AgentWorkflow for FunctionCallingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(
        &self,
        input: &str,
        streaming: bool,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        self.run(input, streaming, events, cancel).await
    }

    async fn fork_for_run(&self) -> Option<Arc<dyn AgentWorkflow>> {
        Some(Arc::new(self.fork().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::memory::Role;
    use crate::tools::EchoTool;
    use serde_json::json;

    fn echo_executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        ToolExecutor::new(registry, 5)
    }

    fn echo_call(id: &str) -> Message {
        Message::assistant_tool_calls("", vec![ToolCall::new("echo", id, json!({"text": "pong"}))])
    }

    #[tokio::test]
    async fn test_plain_reply_finishes_without_sources() {
        let llm = Arc::new(ScriptedLlmClient::from_texts(["Hi there"]));
        let agent = FunctionCallingAgent::new("solo", llm, ToolExecutor::new(ToolRegistry::new(), 5));
        let (sink, mut events) = EventSink::channel();
        let out = agent
            .run("Hello", false, &sink, &CancellationToken::new())
            .await
            .unwrap();
        let result = out.into_result().await.unwrap();
        assert_eq!(result.final_message.content, "Hi there");
        assert!(result.sources.is_empty());

        let msgs: Vec<String> = events.drain_ready().into_iter().map(|e| e.message).collect();
        assert_eq!(msgs, vec!["Start to work on: Hello", "Finished task"]);
    }

    #[tokio::test]
    async fn test_tool_round_trip_records_one_tool_message() {
        let llm = Arc::new(ScriptedLlmClient::new([echo_call("c1"), Message::assistant("done")]));
        let agent = FunctionCallingAgent::new("solo", llm, echo_executor());
        let out = agent
            .run("ping", false, &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap()
            .into_result()
            .await
            .unwrap();
        assert_eq!(out.sources.len(), 1);
        assert_eq!(out.sources[0].content, "pong");

        let roles: Vec<Role> = agent.memory().await.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_system_prompt_is_added_once() {
        let llm = Arc::new(ScriptedLlmClient::from_texts(["a", "b"]));
        let agent = FunctionCallingAgent::new("solo", llm, echo_executor()).with_system_prompt("sys");
        let cancel = CancellationToken::new();
        agent.run("one", false, &EventSink::noop(), &cancel).await.unwrap();
        agent.run("two", false, &EventSink::noop(), &cancel).await.unwrap();
        let systems = agent
            .memory()
            .await
            .iter()
            .filter(|m| m.role == Role::System)
            .count();
        assert_eq!(systems, 1);
    }

    #[tokio::test]
    async fn test_streaming_text_is_lazy_and_recorded() {
        let llm = Arc::new(ScriptedLlmClient::from_texts(["streamed answer here"]));
        let agent = FunctionCallingAgent::new("solo", llm, echo_executor());
        let out = agent
            .run("q", true, &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.is_streaming());
        // 未消费前记忆里还没有回答
        assert_eq!(agent.memory().await.len(), 1);
        let result = out.into_result().await.unwrap();
        assert_eq!(result.final_message.content, "streamed answer here");
        let memory = agent.memory().await;
        assert_eq!(memory.last().map(|m| m.content.as_str()), Some("streamed answer here"));
    }

    #[tokio::test]
    async fn test_streaming_tool_call_then_text() {
        let llm = Arc::new(ScriptedLlmClient::new([echo_call("c1"), Message::assistant("final words")]));
        let agent = FunctionCallingAgent::new("solo", llm, echo_executor());
        let out = agent
            .run("q", true, &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.sources().len(), 1);
        let result = out.into_result().await.unwrap();
        assert_eq!(result.final_message.content, "final words");
    }

    #[tokio::test]
    async fn test_iteration_cap_stops_endless_tool_calls() {
        let llm = Arc::new(ScriptedLlmClient::new(
            (0..5).map(|i| echo_call(&format!("c{}", i))),
        ));
        let agent = FunctionCallingAgent::new("solo", llm, echo_executor()).with_max_tool_iterations(2);
        let out = agent
            .run("loop", false, &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap()
            .into_result()
            .await
            .unwrap();
        assert!(out
            .final_message
            .content
            .starts_with("Reached the maximum number of tool iterations (2)"));
        assert_eq!(out.sources.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_tool_does_not_crash_loop() {
        let call = Message::assistant_tool_calls("", vec![ToolCall::new("ghost", "g1", json!({}))]);
        let llm = Arc::new(ScriptedLlmClient::new([call, Message::assistant("recovered")]));
        let agent = FunctionCallingAgent::new("solo", llm, echo_executor());
        let out = agent
            .run("x", false, &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap()
            .into_result()
            .await
            .unwrap();
        assert_eq!(out.final_message.content, "recovered");
        assert!(out.sources.is_empty());
        let memory = agent.memory().await;
        let tool_msg = memory.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_msg.content, "Tool ghost does not exist");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("g1"));
    }

    #[tokio::test]
    async fn test_cancelled_before_decide() {
        let llm = Arc::new(ScriptedLlmClient::from_texts(["never"]));
        let agent = FunctionCallingAgent::new("solo", llm, echo_executor());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = agent.run("x", false, &EventSink::noop(), &cancel).await;
        assert!(matches!(res, Err(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_tight_context_window_keeps_tool_call_pairing() {
        let long = "a".repeat(400);
        let llm = Arc::new(
            ScriptedLlmClient::new([
                Message::assistant_tool_calls(
                    "",
                    vec![ToolCall::new("echo", "c1", json!({"text": long}))],
                ),
                Message::assistant("done"),
            ])
            .with_context_window(400),
        );
        let agent = FunctionCallingAgent::new("solo", llm.clone(), echo_executor());
        let out = agent
            .run("say it", false, &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap()
            .into_result()
            .await
            .unwrap();
        assert_eq!(out.final_message.content, "done");

        let calls = llm.calls();
        let second: Vec<Role> = calls[1].iter().map(|m| m.role).collect();
        assert_eq!(second, vec![Role::User, Role::Assistant, Role::Tool]);
        assert_eq!(calls[1][0].content, "say it");
        assert_eq!(calls[1][2].tool_call_id.as_deref(), Some("c1"));
    }
}
