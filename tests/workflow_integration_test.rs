//! 工作流集成测试：从配置构建引擎，经运行句柄与 Vercel 流输出帧

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};

use ragent::agent::create_chat_engine;
use ragent::chat::{vercel_stream, StreamOptions, DATA_PREFIX, TEXT_PREFIX};
use ragent::config::{AgentConfig, AppConfig};
use ragent::core::AgentError;
use ragent::llm::{LlmClient, ScriptedLlmClient};
use ragent::memory::{Message, ToolCall};
use ragent::tools::{KeywordRetriever, QueryEngine};
use ragent::workflow::{validate_plan, Plan, Planner, SubTask};
use ragent::{spawn_workflow, ChatEngine};

fn agent(name: &str, tools: &[&str]) -> AgentConfig {
    AgentConfig {
        name: name.to_string(),
        role: format!("a {name}"),
        goal: "help".to_string(),
        tools: tools.iter().map(|t| t.to_string()).collect(),
        ..AgentConfig::default()
    }
}

fn config(agents: Vec<AgentConfig>) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.agents = agents;
    cfg.chat.suggest_next_questions = false;
    cfg
}

fn empty_retriever() -> Arc<dyn QueryEngine> {
    Arc::new(KeywordRetriever::default())
}

fn engine(cfg: &AppConfig, llm: Arc<ScriptedLlmClient>) -> ChatEngine {
    create_chat_engine(cfg, llm as Arc<dyn LlmClient>, empty_retriever(), Vec::new()).unwrap()
}

async fn collect_frames(engine: ChatEngine, input: &str) -> Vec<String> {
    let handler = spawn_workflow(engine.into_workflow(), input, true, Duration::from_secs(5));
    vercel_stream(handler, StreamOptions::default()).collect().await
}

fn data(frame: &str) -> Option<Value> {
    let body = frame.strip_prefix(DATA_PREFIX)?.strip_suffix('\n')?;
    let arr: Value = serde_json::from_str(body).ok()?;
    arr.get(0).cloned()
}

fn text(frames: &[String]) -> String {
    frames
        .iter()
        .filter_map(|f| f.strip_prefix(TEXT_PREFIX))
        .map(|body| serde_json::from_str::<String>(body.trim_end()).unwrap())
        .collect()
}

fn agent_events(frames: &[String]) -> Vec<(String, String)> {
    frames
        .iter()
        .filter_map(|f| data(f))
        .filter(|v| v["type"] == "agent")
        .map(|v| {
            (
                v["data"]["agent"].as_str().unwrap().to_string(),
                v["data"]["text"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_single_agent_without_tools_streams_answer() {
    let llm = Arc::new(ScriptedLlmClient::from_texts(["Hi there, how can I help?"]));
    let engine = engine(&config(vec![agent("assistant", &[])]), llm);
    assert_eq!(engine.kind(), "agent");

    let frames = collect_frames(engine, "Hello").await;
    assert_eq!(frames[0], "0:\"\"\n");
    assert_eq!(text(&frames), "Hi there, how can I help?");
    assert_eq!(
        agent_events(&frames),
        vec![
            ("assistant".to_string(), "Start to work on: Hello".to_string()),
            ("assistant".to_string(), "Finished task".to_string()),
        ]
    );
    assert!(frames.iter().filter_map(|f| data(f)).all(|v| v["type"] != "sources"));
}

#[tokio::test]
async fn test_single_agent_tool_call_produces_sources() {
    let llm = Arc::new(ScriptedLlmClient::new([
        Message::assistant_tool_calls("", vec![ToolCall::new("echo", "call_1", json!({"text": "ping"}))]),
        Message::assistant("The tool said ping"),
    ]));
    let engine = engine(&config(vec![agent("assistant", &["echo"])]), Arc::clone(&llm));

    let frames = collect_frames(engine, "say ping").await;
    assert_eq!(text(&frames), "The tool said ping");

    let sources = frames
        .iter()
        .filter_map(|f| data(f))
        .find(|v| v["type"] == "sources")
        .expect("sources frame");
    let nodes = sources["data"]["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["text"], "ping");
    assert_eq!(nodes[0]["metadata"]["tool_name"], "echo");

    // 第二次调用能看到工具结果
    let calls = llm.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].iter().any(|m| m.content == "ping"));
}

#[tokio::test]
async fn test_orchestrator_delegates_and_streams_last_sub_task() {
    let plan = json!({ "sub_tasks": [
        {"name": "research", "input": "find facts", "expected_output": "facts", "dependencies": []},
        {"name": "write", "input": "write a post", "expected_output": "post", "dependencies": ["research"]}
    ]});
    // 规划器、执行器与两个 Agent 共用同一个脚本队列，调用严格按顺序发生
    let llm = Arc::new(ScriptedLlmClient::new([
        Message::assistant(plan.to_string()),
        Message::assistant_tool_calls(
            "",
            vec![ToolCall::new("call_researcher", "c1", json!({"input": "find facts"}))],
        ),
        Message::assistant("three facts"),
        Message::assistant("three facts"),
        Message::assistant_tool_calls(
            "",
            vec![ToolCall::new("call_writer", "c2", json!({"input": "write a post"}))],
        ),
        Message::assistant("a short post"),
        Message::assistant("a short post"),
    ]));
    let cfg = config(vec![agent("researcher", &[]), agent("writer", &[])]);
    let engine = engine(&cfg, Arc::clone(&llm));
    assert_eq!(engine.kind(), "orchestrator");

    let frames = collect_frames(engine, "Write a blog post").await;
    assert_eq!(frames[0], "0:\"\"\n");
    assert_eq!(text(&frames), "a short post");
    assert_eq!(llm.remaining(), 0);

    let events = agent_events(&frames);
    let agents: Vec<&str> = events.iter().map(|(a, _)| a.as_str()).collect();
    assert_eq!(
        agents,
        vec!["orchestrator", "researcher", "researcher", "writer", "writer"]
    );
    assert!(events[0].1.starts_with("Plan created: Let's do: research, write"));

    // 所有事件帧都在第一个非空文本帧之前
    let first_token = frames
        .iter()
        .position(|f| f.starts_with(TEXT_PREFIX) && f != "0:\"\"\n")
        .unwrap();
    let last_event = frames
        .iter()
        .rposition(|f| data(f).map(|v| v["type"] == "agent").unwrap_or(false))
        .unwrap();
    assert!(last_event < first_token);
}

#[tokio::test]
async fn test_single_query_agent_uses_context_engine() {
    let retriever: Arc<dyn QueryEngine> = Arc::new(KeywordRetriever::from_markdown(
        "kb.md",
        "## Rust\nRust is a systems programming language.\n## Cooking\nPasta needs salted water.",
    ));
    let llm = Arc::new(ScriptedLlmClient::from_texts(["Rust is a systems language."]));
    let cfg = config(vec![agent("librarian", &["query"])]);
    let engine = create_chat_engine(&cfg, Arc::clone(&llm) as Arc<dyn LlmClient>, retriever, Vec::new())
        .unwrap();
    assert_eq!(engine.kind(), "context");

    let frames = collect_frames(engine, "What is Rust?").await;
    assert_eq!(text(&frames), "Rust is a systems language.");

    let sources = frames
        .iter()
        .filter_map(|f| data(f))
        .find(|v| v["type"] == "sources")
        .expect("sources frame");
    let nodes = sources["data"]["nodes"].as_array().unwrap();
    assert!(!nodes.is_empty());
    assert!(nodes[0]["text"].as_str().unwrap().contains("systems programming"));

    let system = &llm.calls()[0][0];
    assert!(system.content.contains("systems programming"));
}

#[tokio::test]
async fn test_no_enabled_agents_is_an_error() {
    let mut disabled = agent("assistant", &[]);
    disabled.enabled = false;
    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::from_texts(Vec::<String>::new()));
    let result = create_chat_engine(&config(vec![disabled]), llm, empty_retriever(), Vec::new());
    assert!(matches!(result, Err(AgentError::NoAgents)));
}

#[tokio::test]
async fn test_client_disconnect_cancels_run() {
    let llm = Arc::new(
        ScriptedLlmClient::from_texts(["never delivered"]).with_reply_delay(Duration::from_secs(30)),
    );
    let engine = engine(&config(vec![agent("assistant", &[])]), llm);

    let handler = spawn_workflow(engine.into_workflow(), "Hello", true, Duration::from_secs(60));
    let token = handler.cancellation_token();
    let mut frames = vercel_stream(handler, StreamOptions::default());

    assert_eq!(frames.next().await.unwrap(), "0:\"\"\n");
    let started = data(&frames.next().await.unwrap()).unwrap();
    assert_eq!(started["data"]["text"], "Start to work on: Hello");
    drop(frames);

    tokio::time::timeout(Duration::from_secs(2), token.cancelled())
        .await
        .expect("run cancelled after client went away");
}

#[tokio::test]
async fn test_workflow_timeout_ends_stream() {
    let llm = Arc::new(
        ScriptedLlmClient::from_texts(["too late"]).with_reply_delay(Duration::from_secs(30)),
    );
    let engine = engine(&config(vec![agent("assistant", &[])]), llm);

    let handler = spawn_workflow(engine.into_workflow(), "Hello", false, Duration::from_millis(50));
    let err = handler.await.unwrap_err();
    assert!(matches!(err, AgentError::WorkflowTimeout(_)));
}

#[tokio::test]
async fn test_unparseable_plan_falls_back_to_single_task() {
    let llm = Arc::new(ScriptedLlmClient::from_texts(["I would rather not plan."]));
    let mut planner = Planner::new(llm, "echo: repeat text");
    let (plan_id, plan) = planner.create_plan("X", &[]).await.unwrap();

    assert_eq!(plan.sub_tasks.len(), 1);
    assert_eq!(plan.sub_tasks[0].input, "X");
    assert!(plan.sub_tasks[0].dependencies.is_empty());
    assert_eq!(planner.state().next_sub_tasks(&plan_id).len(), 1);
}

#[tokio::test]
async fn test_plan_with_dangling_dependency_is_replaced() {
    let bad = json!({ "sub_tasks": [
        {"name": "a", "input": "do a", "expected_output": "", "dependencies": ["ghost"]}
    ]});
    assert!(validate_plan(&serde_json::from_value::<Plan>(bad.clone()).unwrap()).is_err());

    let llm = Arc::new(ScriptedLlmClient::from_texts([bad.to_string()]));
    let mut planner = Planner::new(llm, "");
    let (_, plan) = planner.create_plan("the task", &[]).await.unwrap();
    assert!(validate_plan(&plan).is_ok());
    assert_eq!(plan.sub_tasks[0].input, "the task");
}

#[tokio::test]
async fn test_completion_is_monotonic() {
    let plan = json!({ "sub_tasks": [
        {"name": "a", "input": "do a", "expected_output": "", "dependencies": []},
        {"name": "b", "input": "do b", "expected_output": "", "dependencies": ["a"]}
    ]});
    let llm = Arc::new(ScriptedLlmClient::from_texts([plan.to_string()]));
    let mut planner = Planner::new(llm, "");
    let (plan_id, _) = planner.create_plan("task", &[]).await.unwrap();

    let ready: Vec<SubTask> = planner.state().next_sub_tasks(&plan_id);
    assert_eq!(ready.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), vec!["a"]);

    planner.mark_completed(&plan_id, "a");
    planner.mark_completed(&plan_id, "a");
    assert_eq!(planner.state().completed(&plan_id).to_vec(), vec!["a".to_string()]);
    let ready = planner.state().next_sub_tasks(&plan_id);
    assert_eq!(ready.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), vec!["b"]);

    planner.mark_completed(&plan_id, "b");
    assert!(planner.state().next_sub_tasks(&plan_id).is_empty());
    assert!(planner.state().remaining_sub_tasks(&plan_id).is_empty());
}
