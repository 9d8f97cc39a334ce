//! 上下文对话引擎（非 Agent 路径）
//!
//! 只有一个检索工具时不走工具循环：先把追问改写成独立问题，检索 top_k 个节点，
//! 把节点文本放进 system 提示，再直接（流式）回答。检索到的节点作为 sources 返回。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::{ConversationMemory, Message, Role, TokenBudget};
use crate::tools::{format_nodes, QueryEngine, ToolOutput, QUERY_TOOL_NAME};
use crate::workflow::single::token_stream;
use crate::workflow::{AgentOutput, AgentRunResult, AgentWorkflow, EventSink};

const CONDENSE_PROMPT: &str = "Given a conversation (between Human and Assistant) and a follow up message from Human, rewrite the message to be a standalone question that captures all relevant context from the conversation.

<Chat History>
{chat_history}

<Follow Up Message>
{question}

<Standalone question>
";

const CONTEXT_PROMPT: &str = "Context information is below.
--------------------
{context_str}
--------------------
";

pub struct ContextChatEngine {
    name: String,
    llm: Arc<dyn LlmClient>,
    retriever: Arc<dyn QueryEngine>,
    top_k: usize,
    system_prompt: Option<String>,
    memory: Arc<Mutex<ConversationMemory>>,
}

impl ContextChatEngine {
    pub fn new(llm: Arc<dyn LlmClient>, retriever: Arc<dyn QueryEngine>, top_k: usize) -> Self {
        let budget = TokenBudget::new(llm.context_window());
        Self {
            name: "context".to_string(),
            llm,
            retriever,
            top_k,
            system_prompt: None,
            memory: Arc::new(Mutex::new(ConversationMemory::with_budget(budget))),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_history(self, history: impl IntoIterator<Item = Message>) -> Self {
        let memory = {
            let mut memory = ConversationMemory::with_budget(TokenBudget::new(self.llm.context_window()));
            for msg in history {
                memory.append(msg);
            }
            memory
        };
        Self {
            memory: Arc::new(Mutex::new(memory)),
            ..self
        }
    }

    pub async fn memory(&self) -> Vec<Message> {
        self.memory.lock().await.get()
    }

    pub async fn chat(
        &self,
        input: &str,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        let history = self.memory.lock().await.get();
        let question = self.condense_question(&history, input, cancel).await?;

        let nodes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            res = self.retriever.query(&question, self.top_k, None) => {
                res.map_err(AgentError::ToolExecutionFailed)?
            }
        };
        tracing::debug!(question = %question, nodes = nodes.len(), "retrieved context");

        let context = CONTEXT_PROMPT.replace("{context_str}", &format_nodes(&nodes));
        let system = match &self.system_prompt {
            Some(prompt) => format!("{prompt}\n\n{context}"),
            None => context,
        };

        let mut messages = vec![Message::system(system)];
        messages.extend(history.into_iter().filter(|m| m.role != Role::System));
        messages.push(Message::user(input));
        self.memory.lock().await.append(Message::user(input));

        let sources = if nodes.is_empty() {
            Vec::new()
        } else {
            vec![ToolOutput {
                tool_name: QUERY_TOOL_NAME.to_string(),
                call_id: "context".to_string(),
                content: format_nodes(&nodes),
                raw_output: serde_json::to_value(&nodes)
                    .map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?,
                is_error: false,
            }]
        };

        if streaming {
            let chunks = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                s = self.llm.chat_stream(&messages, &[]) => s?,
            };
            let tokens = token_stream(None, chunks, Arc::clone(&self.memory), cancel.clone());
            Ok(AgentOutput::Streaming { tokens, sources })
        } else {
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.llm.chat(&messages, &[]) => r?,
            };
            self.memory.lock().await.append(reply.clone());
            Ok(AgentOutput::Complete(AgentRunResult {
                final_message: reply,
                sources,
            }))
        }
    }

    /// 没有历史时原样返回
    async fn condense_question(
        &self,
        history: &[Message],
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let turns: Vec<String> = history
            .iter()
            .filter_map(|m| match m.role {
                Role::User => Some(format!("Human: {}", m.content)),
                Role::Assistant if !m.content.is_empty() => Some(format!("Assistant: {}", m.content)),
                _ => None,
            })
            .collect();
        if turns.is_empty() {
            return Ok(input.to_string());
        }
        let prompt = CONDENSE_PROMPT
            .replace("{chat_history}", &turns.join("\n"))
            .replace("{question}", input);
        let condensed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = self.llm.complete(&prompt) => r?,
        };
        let condensed = condensed.trim();
        Ok(if condensed.is_empty() {
            input.to_string()
        } else {
            condensed.to_string()
        })
    }
}

#[async_trait]
impl AgentWorkflow for ContextChatEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        input: &str,
        streaming: bool,
        _events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        self.chat(input, streaming, cancel).await
    }
}
