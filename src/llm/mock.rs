//! Mock LLM 客户端（用于测试与本地演示，无需 API）
//!
//! - MockLlmClient：回显最后一条 User 消息，从不调用工具；
//! - ScriptedLlmClient：按顺序返回预先编排的消息（可含 tool_calls），并记录每次收到的对话，
//!   用于确定性地驱动 Agent / 编排器测试。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::{ChatChunk, ChatStream, LlmClient, LlmError};
use crate::memory::{Message, Role};
use crate::tools::ToolMetadata;

/// 把完整消息切成流式 chunk：文本按词切分（保留空格），每个 chunk 携带截至当时的累积消息；
/// 含 tool_calls 的消息第一个 chunk 即带上完整调用
fn to_chunks(message: &Message) -> Vec<ChatChunk> {
    if message.has_tool_calls() || message.content.is_empty() {
        return vec![ChatChunk {
            delta: message.content.clone(),
            message: message.clone(),
        }];
    }
    let mut acc = String::new();
    message
        .content
        .split_inclusive(' ')
        .map(|piece| {
            acc.push_str(piece);
            ChatChunk {
                delta: piece.to_string(),
                message: Message::assistant(acc.clone()),
            }
        })
        .collect()
}

fn chunk_stream(chunks: Vec<ChatChunk>, delay: Duration) -> ChatStream {
    Box::pin(stream::iter(chunks).then(move |chunk| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(chunk)
    }))
}

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, messages: &[Message], _tools: &[ToolMetadata]) -> Result<Message, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(Message::assistant(format!("Echo from Mock: {}", last_user)))
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolMetadata],
    ) -> Result<ChatStream, LlmError> {
        let reply = self.chat(messages, tools).await?;
        Ok(chunk_stream(to_chunks(&reply), Duration::ZERO))
    }
}

/// 脚本化客户端：chat / chat_stream / complete 共用一个回复队列
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<Message, LlmError>>>,
    calls: Mutex<Vec<Vec<Message>>>,
    chunk_delay: Duration,
    reply_delay: Duration,
    context_window: usize,
}

impl ScriptedLlmClient {
    pub fn new(replies: impl IntoIterator<Item = Message>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            calls: Mutex::new(Vec::new()),
            chunk_delay: Duration::ZERO,
            reply_delay: Duration::ZERO,
            context_window: 4096,
        }
    }

    /// 便捷构造：纯文本回复序列
    pub fn from_texts<S: Into<String>>(texts: impl IntoIterator<Item = S>) -> Self {
        Self::new(texts.into_iter().map(Message::assistant))
    }

    pub fn push(&self, reply: Message) {
        self.lock_replies().push_back(Ok(reply));
    }

    pub fn push_error(&self, err: LlmError) {
        self.lock_replies().push_back(Err(err));
    }

    /// 流式输出时每个 chunk 之间的延迟
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// 每次调用返回前的延迟（模拟慢网络）
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    pub fn with_context_window(mut self, context_window: usize) -> Self {
        self.context_window = context_window;
        self
    }

    /// 每次调用收到的完整对话（按调用顺序）
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.lock_replies().len()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Message, LlmError>>> {
        self.replies.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn next_reply(&self, messages: &[Message]) -> Result<Message, LlmError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());
        if !self.reply_delay.is_zero() {
            tokio::time::sleep(self.reply_delay).await;
        }
        self.lock_replies()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::InvalidResponse("script exhausted".to_string())))
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn chat(&self, messages: &[Message], _tools: &[ToolMetadata]) -> Result<Message, LlmError> {
        self.next_reply(messages).await
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        _tools: &[ToolMetadata],
    ) -> Result<ChatStream, LlmError> {
        let reply = self.next_reply(messages).await?;
        Ok(chunk_stream(to_chunks(&reply), self.chunk_delay))
    }

    fn context_window(&self) -> usize {
        self.context_window
    }
}
