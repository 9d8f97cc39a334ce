//! 规划编排器（StructuredPlannerAgent）
//!
//! `CreatePlan → ExecuteReady → Gather → (Refine)? → ExecuteReady | Terminate`
//!
//! 所有子任务都交给同一个执行 Agent（记忆共享，知道此前所有工具调用）。
//! 执行 Agent 的工具通常是 `call_<agent>` 委托工具，子 Agent 的事件经同一个 EventSink 冒泡。
//! 每次运行的可变状态放在 RunContext 中，PlannerState 随运行创建、随结果丢弃。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::tools::{AgentCallTool, Tool, ToolExecutor, ToolRegistry};
use crate::workflow::planner::{Planner, PlannerState};
use crate::workflow::single::FunctionCallingAgent;
use crate::workflow::{
    plan_event_message, AgentOutput, AgentWorkflow, DispatchPolicy, EventSink, PlanEventType,
    SubTask,
};

pub const EXECUTOR_SYSTEM_PROMPT: &str = "You are an expert in completing given tasks by calling the right tool for the task. Just return the result of the tool call. Don't add any information yourself";

enum OrchestratorState {
    CreatePlan,
    ExecuteReady,
    Gather(Vec<(SubTask, AgentOutput)>),
    Refine,
    Terminate,
}

/// 单次运行的上下文
struct RunContext<'a> {
    task: &'a str,
    streaming: bool,
    plan_id: String,
    /// (子任务名, 输出)，按完成顺序，供细化计划使用
    results: Vec<(String, String)>,
    last: Option<AgentOutput>,
}

pub struct StructuredPlannerAgent {
    name: String,
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    executor: FunctionCallingAgent,
    history: Vec<Message>,
    refine_plan: bool,
    dispatch_policy: DispatchPolicy,
}

impl StructuredPlannerAgent {
    pub fn new(name: impl Into<String>, llm: Arc<dyn LlmClient>, executor_tools: ToolExecutor) -> Self {
        let tools = executor_tools.registry().clone();
        let executor = FunctionCallingAgent::new("executor", Arc::clone(&llm), executor_tools)
            .with_system_prompt(EXECUTOR_SYSTEM_PROMPT)
            .with_write_events(false);
        Self {
            name: name.into(),
            llm,
            tools,
            executor,
            history: Vec::new(),
            refine_plan: false,
            dispatch_policy: DispatchPolicy::default(),
        }
    }

    /// 多 Agent 编排：每个参与者包装为 `call_<name>` 委托工具
    pub fn from_agents(
        name: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        agents: Vec<Arc<dyn AgentWorkflow>>,
        tool_timeout_secs: u64,
    ) -> Self {
        let registry = ToolRegistry::from_tools(
            agents
                .into_iter()
                .map(|a| Arc::new(AgentCallTool::new(a)) as Arc<dyn Tool>),
        );
        Self::new(name, llm, ToolExecutor::new(registry, tool_timeout_secs))
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_refine_plan(mut self, refine_plan: bool) -> Self {
        self.refine_plan = refine_plan;
        self
    }

    pub fn with_dispatch_policy(mut self, policy: DispatchPolicy) -> Self {
        self.dispatch_policy = policy;
        self
    }

    pub fn with_max_tool_iterations(mut self, max: usize) -> Self {
        self.executor = self.executor.with_max_tool_iterations(max);
        self
    }

    pub fn executor(&self) -> &FunctionCallingAgent {
        &self.executor
    }

    pub async fn run(
        &self,
        task: &str,
        streaming: bool,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        self.run_with_state(task, streaming, events, cancel)
            .await
            .map(|(output, _)| output)
    }

    /// 运行并返回本次的 PlannerState（供检查计划与完成集合）
    pub async fn run_with_state(
        &self,
        task: &str,
        streaming: bool,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(AgentOutput, PlannerState), AgentError> {
        let mut planner = Planner::new(Arc::clone(&self.llm), self.tools.catalog());
        let mut ctx = RunContext {
            task,
            streaming,
            plan_id: String::new(),
            results: Vec::new(),
            last: None,
        };
        let mut state = OrchestratorState::CreatePlan;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            state = match state {
                OrchestratorState::CreatePlan => {
                    let (plan_id, plan) = planner.create_plan(ctx.task, &self.history).await?;
                    events.emit(&self.name, plan_event_message(PlanEventType::Created, &plan));
                    ctx.plan_id = plan_id;
                    OrchestratorState::ExecuteReady
                }
                OrchestratorState::ExecuteReady => {
                    let ready = planner.state().next_sub_tasks(&ctx.plan_id);
                    if ready.is_empty() {
                        OrchestratorState::Terminate
                    } else {
                        let remaining = planner.state().remaining_sub_tasks(&ctx.plan_id).len();
                        let outputs = self
                            .execute_ready(ready, remaining, ctx.streaming, events, cancel)
                            .await?;
                        OrchestratorState::Gather(outputs)
                    }
                }
                OrchestratorState::Gather(outputs) => {
                    for (sub_task, output) in outputs {
                        planner.mark_completed(&ctx.plan_id, &sub_task.name);
                        if let AgentOutput::Complete(result) = &output {
                            ctx.results
                                .push((sub_task.name.clone(), result.final_message.content.clone()));
                        }
                        ctx.last = Some(output);
                    }
                    if planner.state().next_sub_tasks(&ctx.plan_id).is_empty() {
                        OrchestratorState::Terminate
                    } else if self.refine_plan {
                        OrchestratorState::Refine
                    } else {
                        OrchestratorState::ExecuteReady
                    }
                }
                OrchestratorState::Refine => {
                    if let Some(plan) = planner
                        .refine_plan(ctx.task, &ctx.plan_id, &ctx.results)
                        .await
                    {
                        events.emit(&self.name, plan_event_message(PlanEventType::Refined, &plan));
                    }
                    OrchestratorState::ExecuteReady
                }
                OrchestratorState::Terminate => {
                    let output = ctx.last.take().ok_or_else(|| {
                        AgentError::PlanValidation("plan has no executable sub tasks".to_string())
                    })?;
                    return Ok((output, planner.state().clone()));
                }
            };
        }
    }

    async fn execute_ready(
        &self,
        ready: Vec<SubTask>,
        remaining: usize,
        streaming: bool,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<(SubTask, AgentOutput)>, AgentError> {
        let batch: Vec<SubTask> = match self.dispatch_policy {
            DispatchPolicy::FirstReady => ready.into_iter().take(1).collect(),
            DispatchPolicy::AllReady => ready,
        };

        if batch.len() == 1 {
            let sub_task = batch.into_iter().next().ok_or_else(|| {
                AgentError::PlanValidation("empty dispatch batch".to_string())
            })?;
            // 只有最后一个子任务、调用方要求流式且不细化计划时，才把 token 直接交给客户端
            let streaming = remaining == 1 && streaming && !self.refine_plan;
            tracing::debug!(sub_task = %sub_task.name, streaming, "executing sub task");
            let output = self
                .executor
                .run(&sub_task.input, streaming, events, cancel)
                .await?;
            return Ok(vec![(sub_task, output)]);
        }

        tracing::debug!(count = batch.len(), "executing ready sub tasks concurrently");
        let runs = batch.iter().map(|sub_task| async move {
            let worker = self.executor.fork().await;
            worker
                .run(&sub_task.input, false, events, cancel)
                .await?
                .into_result()
                .await
        });
        let results = join_all(runs).await;

        let mut outputs = Vec::with_capacity(batch.len());
        for (sub_task, result) in batch.into_iter().zip(results) {
            let result = result?;
            self.executor
                .record_exchange(&sub_task.input, &result.final_message)
                .await;
            outputs.push((sub_task, AgentOutput::Complete(result)));
        }
        Ok(outputs)
    }
}

#[async_trait]
impl AgentWorkflow for StructuredPlannerAgent {
    fn name(&self) -> &str {
        &self.name
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::llm::ScriptedLlmClient;
    use crate::memory::{Role, ToolCall};
    use crate::tools::EchoTool;
    use serde_json::json;

    fn plan_reply(tasks: serde_json::Value) -> Message {
        Message::assistant(json!({ "sub_tasks": tasks }).to_string())
    }

    fn echo_tools() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        ToolExecutor::new(registry, 5)
    }

    #[tokio::test]
    async fn test_delegates_sub_tasks_to_agents_in_plan_order() {
        let researcher: Arc<dyn AgentWorkflow> = Arc::new(
            FunctionCallingAgent::new(
                "researcher",
                Arc::new(ScriptedLlmClient::from_texts(["three facts"])),
                ToolExecutor::new(ToolRegistry::new(), 5),
            )
            .with_description("a researcher"),
        );
        let writer: Arc<dyn AgentWorkflow> = Arc::new(FunctionCallingAgent::new(
            "writer",
            Arc::new(ScriptedLlmClient::from_texts(["a short post"])),
            ToolExecutor::new(ToolRegistry::new(), 5),
        ));

        let llm = Arc::new(ScriptedLlmClient::new([
            plan_reply(json!([
                {"name": "research", "input": "find facts", "expected_output": "facts", "dependencies": []},
                {"name": "write", "input": "write a post", "expected_output": "post", "dependencies": ["research"]}
            ])),
            Message::assistant_tool_calls(
                "",
                vec![ToolCall::new("call_researcher", "c1", json!({"input": "find facts"}))],
            ),
            Message::assistant("three facts"),
            Message::assistant_tool_calls(
                "",
                vec![ToolCall::new("call_writer", "c2", json!({"input": "write a post"}))],
            ),
            Message::assistant("a short post"),
        ]));
        let orchestrator =
            StructuredPlannerAgent::from_agents("orchestrator", llm, vec![researcher, writer], 5);

        let (sink, mut events) = EventSink::channel();
        let (output, state) = orchestrator
            .run_with_state("Write a blog post", false, &sink, &CancellationToken::new())
            .await
            .unwrap();
        let result = output.into_result().await.unwrap();
        assert_eq!(result.final_message.content, "a short post");

        let log: Vec<(String, String)> = events
            .drain_ready()
            .into_iter()
            .map(|e| (e.agent_name, e.message))
            .collect();
        assert_eq!(
            log[0],
            ("orchestrator".to_string(), "Plan created: Let's do: research, write".to_string())
        );
        let names: Vec<&str> = log.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["orchestrator", "researcher", "researcher", "writer", "writer"]
        );
        assert_eq!(log[1].1, "Start to work on: find facts");
        assert_eq!(log[2].1, "Finished task");

        let plan_id = state.plan_ids()[0];
        assert_eq!(state.completed(plan_id), ["research", "write"]);
    }

    #[tokio::test]
    async fn test_refined_plan_keeps_completed_tasks() {
        let llm = Arc::new(ScriptedLlmClient::new([
            plan_reply(json!([
                {"name": "a", "input": "do a"},
                {"name": "b", "input": "do b", "dependencies": ["a"]}
            ])),
            Message::assistant("A done"),
            plan_reply(json!([{"name": "c", "input": "do c"}])),
            Message::assistant("C done"),
        ]));
        let orchestrator =
            StructuredPlannerAgent::new("planner", llm, echo_tools()).with_refine_plan(true);

        let (sink, mut events) = EventSink::channel();
        let (output, state) = orchestrator
            .run_with_state("task", true, &sink, &CancellationToken::new())
            .await
            .unwrap();
        // 细化计划开启时不流式
        assert!(!output.is_streaming());
        assert_eq!(output.into_result().await.unwrap().final_message.content, "C done");

        let msgs: Vec<String> = events.drain_ready().into_iter().map(|e| e.message).collect();
        assert_eq!(
            msgs,
            vec!["Plan created: Let's do: a, b", "Plan refined: Let's do: a, c"]
        );

        let plan_id = state.plan_ids()[0];
        let plan = state.plan(plan_id).unwrap();
        assert_eq!(plan.names(), vec!["a", "c"]);
        for name in state.completed(plan_id) {
            assert!(plan.get(name).is_some());
        }
    }

    #[tokio::test]
    async fn test_last_sub_task_streams_when_not_refining() {
        let llm = Arc::new(ScriptedLlmClient::new([
            plan_reply(json!([{"name": "only", "input": "say hi"}])),
            Message::assistant("hi there"),
        ]));
        let orchestrator = StructuredPlannerAgent::new("planner", llm, echo_tools());
        let output = orchestrator
            .run("greet", true, &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.is_streaming());
        assert_eq!(output.into_result().await.unwrap().final_message.content, "hi there");
    }

    #[tokio::test]
    async fn test_all_ready_policy_records_results_in_plan_order() {
        let llm = Arc::new(ScriptedLlmClient::new([
            plan_reply(json!([
                {"name": "x", "input": "do x"},
                {"name": "y", "input": "do y"},
                {"name": "z", "input": "do z", "dependencies": ["x", "y"]}
            ])),
            Message::assistant("ok"),
            Message::assistant("ok"),
            Message::assistant("final"),
        ]));
        let orchestrator = StructuredPlannerAgent::new("planner", llm, echo_tools())
            .with_dispatch_policy(DispatchPolicy::AllReady);
        let output = orchestrator
            .run("task", false, &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.into_result().await.unwrap().final_message.content, "final");

        let users: Vec<String> = orchestrator
            .executor()
            .memory()
            .await
            .into_iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content)
            .collect();
        assert_eq!(users, vec!["do x", "do y", "do z"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<Message>::new()));
        let orchestrator = StructuredPlannerAgent::new("planner", llm, echo_tools());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = orchestrator
            .run("task", false, &EventSink::noop(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_concurrent_sub_tasks_get_separate_delegate_memory() {
        let researcher_llm = Arc::new(
            ScriptedLlmClient::from_texts(["answer", "answer"]).with_reply_delay(Duration::from_millis(20)),
        );
        let researcher = Arc::new(FunctionCallingAgent::new(
            "researcher",
            researcher_llm.clone(),
            ToolExecutor::new(ToolRegistry::new(), 5),
        ));
        let llm = Arc::new(ScriptedLlmClient::new([
            plan_reply(json!([
                {"name": "x", "input": "do x"},
                {"name": "y", "input": "do y"}
            ])),
            Message::assistant_tool_calls(
                "",
                vec![ToolCall::new("call_researcher", "c1", json!({"input": "do x"}))],
            ),
            Message::assistant_tool_calls(
                "",
                vec![ToolCall::new("call_researcher", "c2", json!({"input": "do y"}))],
            ),
            Message::assistant("done"),
            Message::assistant("done"),
        ]));
        let orchestrator = StructuredPlannerAgent::from_agents(
            "orchestrator",
            llm,
            vec![researcher.clone() as Arc<dyn AgentWorkflow>],
            5,
        )
        .with_dispatch_policy(DispatchPolicy::AllReady);

        orchestrator
            .run("task", false, &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap();

        let calls = researcher_llm.calls();
        assert_eq!(calls.len(), 2);
        for history in &calls {
            let users = history.iter().filter(|m| m.role == Role::User).count();
            assert_eq!(users, 1);
        }
        assert!(researcher.memory().await.is_empty());
    }

    #[tokio::test]
    async fn test_delegate_is_not_cut_by_tool_timeout() {
        let researcher: Arc<dyn AgentWorkflow> = Arc::new(FunctionCallingAgent::new(
            "researcher",
            Arc::new(
                ScriptedLlmClient::from_texts(["facts"]).with_reply_delay(Duration::from_millis(1500)),
            ),
            ToolExecutor::new(ToolRegistry::new(), 5),
        ));
        let llm = Arc::new(ScriptedLlmClient::new([
            plan_reply(json!([{"name": "research", "input": "find facts"}])),
            Message::assistant_tool_calls(
                "",
                vec![ToolCall::new("call_researcher", "c1", json!({"input": "find facts"}))],
            ),
            Message::assistant("facts"),
        ]));
        let orchestrator = StructuredPlannerAgent::from_agents("orchestrator", llm, vec![researcher], 1);

        let output = orchestrator
            .run("task", false, &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.into_result().await.unwrap().final_message.content, "facts");

        let tool_replies: Vec<String> = orchestrator
            .executor()
            .memory()
            .await
            .into_iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content)
            .collect();
        assert_eq!(tool_replies, vec!["facts"]);
    }
}
