//! Headless Agent 运行时
//!
//! 供 CLI / HTTP 等前端调用的无界面逻辑：
//! 按配置构建 Agent（名称清洗、角色描述、工具装配），
//! 再按参与者与工具数量选择对话引擎（上下文检索 / 单 Agent / 多 Agent 编排）。

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::chat::{ContextChatEngine, NextQuestionSuggester, DEFAULT_NEXT_QUESTION_PROMPT};
use crate::config::{AgentConfig, AppConfig, ChatSection};
use crate::core::{AgentError, TaskScheduler};
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::tools::{
    EchoTool, KeywordRetriever, QueryEngine, QueryTool, Tool, ToolExecutor, ToolRegistry,
    QUERY_TOOL_NAME,
};
use crate::workflow::{AgentWorkflow, FunctionCallingAgent, StructuredPlannerAgent};

pub const DEFAULT_SYSTEM_CITATION_PROMPT: &str = "You have provided information from a knowledge base that has been passed to you in nodes of information.
Each node has useful metadata such as node ID, file name, page, etc.
Please add the citation to the data node for each sentence or paragraph that you reference in the provided information.
The citation format is: . [citation:<node_id>]()
Where the <node_id> is the unique identifier of the data node.

Example:
We have two nodes:
  node_id: xyz
  file_name: llama.pdf

  node_id: abc
  file_name: animal.pdf

User question: Tell me a fun fact about Llama.
Your answer:
A baby llama is called \"Cria\" [citation:xyz]().
It often live in desert [citation:abc]().
It's cute animal.";

pub const ORCHESTRATOR_NAME: &str = "orchestrator";

/// 函数调用 API 只接受 `^[a-zA-Z0-9_-]+$` 的名字
pub fn sanitize_agent_name(name: &str) -> String {
    match Regex::new(r"[^a-zA-Z0-9_-]") {
        Ok(re) => re.replace_all(name, "").into_owned(),
        Err(_) => name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect(),
    }
}

/// 编排器按角色挑选 Agent，因此描述由 role 与 goal 拼成
pub fn agent_description(role: &str, goal: &str) -> String {
    format!("{}\n and its goals are {}", role, goal)
}

/// 引用提示：显式配置优先，其次 inline_citations 开启时用内置提示
pub fn citation_prompt(chat: &ChatSection) -> Option<String> {
    match &chat.system_citation_prompt {
        Some(prompt) if !prompt.is_empty() => Some(prompt.clone()),
        _ if chat.inline_citations => Some(DEFAULT_SYSTEM_CITATION_PROMPT.to_string()),
        _ => None,
    }
}

pub fn create_suggester(chat: &ChatSection, llm: Arc<dyn LlmClient>) -> Option<NextQuestionSuggester> {
    if !chat.suggest_next_questions {
        return None;
    }
    let prompt = chat
        .next_question_prompt
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_NEXT_QUESTION_PROMPT.to_string());
    Some(NextQuestionSuggester::new(llm, prompt))
}

/// 从 [chat].knowledge_file 建检索库；未配置或读取失败时为空库
pub fn load_retriever(chat: &ChatSection) -> Arc<dyn QueryEngine> {
    let Some(path) = &chat.knowledge_file else {
        return Arc::new(KeywordRetriever::default());
    };
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let retriever = KeywordRetriever::from_markdown(&source, &content);
            tracing::info!(path = %path.display(), chunks = retriever.len(), "knowledge loaded");
            Arc::new(retriever)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read knowledge file");
            Arc::new(KeywordRetriever::default())
        }
    }
}

pub fn workflow_timeout(cfg: &AppConfig) -> Duration {
    Duration::from_secs(cfg.workflow.timeout_secs)
}

/// 按名字创建工具：echo / query（QueryEngine）
pub struct ToolFactory {
    retriever: Arc<dyn QueryEngine>,
    top_k: usize,
}

impl ToolFactory {
    pub fn new(retriever: Arc<dyn QueryEngine>, top_k: usize) -> Self {
        Self { retriever, top_k }
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn Tool>> {
        match name {
            "echo" => Some(Arc::new(EchoTool)),
            "query" | QUERY_TOOL_NAME => Some(Arc::new(QueryTool::new(
                Arc::clone(&self.retriever),
                self.top_k,
            ))),
            other => {
                tracing::warn!(tool = %other, "unknown tool in agent config, skipping");
                None
            }
        }
    }
}

/// 一个已启用 Agent 的构建结果（选择引擎时需要看它的工具）
pub struct AgentSpec {
    pub name: String,
    pub description: String,
    pub system_prompt: Option<String>,
    pub tools: Vec<Arc<dyn Tool>>,
}

impl AgentSpec {
    fn from_config(agent: &AgentConfig, default_prompt: Option<&str>, factory: &ToolFactory) -> Self {
        Self {
            name: sanitize_agent_name(&agent.name),
            description: agent_description(&agent.role, &agent.goal),
            system_prompt: agent
                .system_prompt
                .clone()
                .or_else(|| default_prompt.map(str::to_string)),
            tools: agent.tools.iter().filter_map(|t| factory.create(t)).collect(),
        }
    }

    fn only_tool_is_query(&self) -> bool {
        self.tools.len() == 1 && self.tools[0].name() == QUERY_TOOL_NAME
    }

    fn into_agent(
        self,
        cfg: &AppConfig,
        llm: Arc<dyn LlmClient>,
        scheduler: &TaskScheduler,
        history: &[Message],
    ) -> FunctionCallingAgent {
        let executor = ToolExecutor::new(ToolRegistry::from_tools(self.tools), cfg.agent.tool_timeout_secs)
            .with_scheduler(scheduler.clone());
        let mut agent = FunctionCallingAgent::new(self.name, llm, executor)
            .with_description(self.description)
            .with_history(history.iter().cloned())
            .with_max_tool_iterations(cfg.agent.max_tool_iterations);
        if let Some(prompt) = self.system_prompt {
            agent = agent.with_system_prompt(prompt);
        }
        agent
    }
}

pub fn build_agent_specs(cfg: &AppConfig, factory: &ToolFactory) -> Vec<AgentSpec> {
    cfg.agents
        .iter()
        .filter(|a| a.enabled)
        .map(|a| AgentSpec::from_config(a, cfg.chat.system_prompt.as_deref(), factory))
        .collect()
}

/// 选中的对话引擎
pub enum ChatEngine {
    Context(ContextChatEngine),
    Agent(FunctionCallingAgent),
    Orchestrator(StructuredPlannerAgent),
}

impl ChatEngine {
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEngine::Context(_) => "context",
            ChatEngine::Agent(_) => "agent",
            ChatEngine::Orchestrator(_) => "orchestrator",
        }
    }

    pub fn into_workflow(self) -> Arc<dyn AgentWorkflow> {
        match self {
            ChatEngine::Context(e) => Arc::new(e),
            ChatEngine::Agent(a) => Arc::new(a),
            ChatEngine::Orchestrator(o) => Arc::new(o),
        }
    }
}

/// 按参与者选择引擎：
/// - 无启用的 Agent：`NoAgents`
/// - 唯一 Agent 且唯一工具是检索工具：上下文检索引擎
/// - 唯一 Agent 且至多一个工具：直接使用该 Agent
/// - 其余：多 Agent 编排
///
/// 只有一个 Agent 时引用提示追加到它的 system 提示后。
pub fn create_chat_engine(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
    retriever: Arc<dyn QueryEngine>,
    history: Vec<Message>,
) -> Result<ChatEngine, AgentError> {
    let factory = ToolFactory::new(Arc::clone(&retriever), cfg.chat.top_k);
    let mut specs = build_agent_specs(cfg, &factory);
    let scheduler = TaskScheduler::new(cfg.agent.max_concurrent_tools);

    if specs.len() == 1 {
        let mut spec = specs.remove(0);
        if let Some(citation) = citation_prompt(&cfg.chat) {
            spec.system_prompt = Some(match spec.system_prompt.take() {
                Some(prompt) => format!("{prompt}\n{citation}"),
                None => citation,
            });
        }

        if spec.only_tool_is_query() {
            tracing::info!(agent = %spec.name, "using context chat engine");
            let mut engine = ContextChatEngine::new(llm, retriever, cfg.chat.top_k)
                .with_name(spec.name)
                .with_history(history);
            if let Some(prompt) = spec.system_prompt {
                engine = engine.with_system_prompt(prompt);
            }
            return Ok(ChatEngine::Context(engine));
        }
        if spec.tools.len() <= 1 {
            tracing::info!(agent = %spec.name, "using single agent");
            return Ok(ChatEngine::Agent(spec.into_agent(cfg, llm, &scheduler, &history)));
        }
        specs.push(spec);
    }

    if specs.is_empty() {
        return Err(AgentError::NoAgents);
    }

    tracing::info!(agents = specs.len(), "using agent orchestrator");
    let agents: Vec<Arc<dyn AgentWorkflow>> = specs
        .into_iter()
        .map(|s| Arc::new(s.into_agent(cfg, Arc::clone(&llm), &scheduler, &history)) as Arc<dyn AgentWorkflow>)
        .collect();
    let orchestrator = StructuredPlannerAgent::from_agents(
        ORCHESTRATOR_NAME,
        llm,
        agents,
        cfg.agent.tool_timeout_secs,
    )
    .with_history(history)
    .with_refine_plan(cfg.workflow.refine_plan)
    .with_dispatch_policy(cfg.workflow.dispatch_policy)
    .with_max_tool_iterations(cfg.agent.max_tool_iterations);
    Ok(ChatEngine::Orchestrator(orchestrator))
}
