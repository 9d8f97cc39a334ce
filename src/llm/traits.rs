//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：chat（非流式，可能返回 tool_calls）、
//! chat_stream（流式 chunk）。RetryingLlmClient 为任意后端加上指数退避重试。

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::memory::Message;
use crate::tools::ToolMetadata;

/// LLM 调用错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Cancelled")]
    Cancelled,
}

impl LlmError {
    /// 网络抖动与限流可重试；其余（参数错误、响应格式错误）重试无意义
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Network(_) | LlmError::RateLimited { .. })
    }
}

/// 流式响应的单个 chunk：本次增量文本 + 截至目前累积的完整消息（含已识别的 tool_calls）
#[derive(Debug, Clone)]
pub struct ChatChunk {
    pub delta: String,
    pub message: Message,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>>;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式：返回 Assistant 消息；若模型决定调用工具，则 `tool_calls` 非空
    async fn chat(&self, messages: &[Message], tools: &[ToolMetadata]) -> Result<Message, LlmError>;

    /// 流式：返回 chunk 流
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolMetadata],
    ) -> Result<ChatStream, LlmError>;

    /// 单轮文本补全（结构化预测、问题建议等使用）
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let reply = self.chat(&[Message::user(prompt)], &[]).await?;
        Ok(reply.content)
    }

    /// 模型上下文窗口（token）
    fn context_window(&self) -> usize {
        4096
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryConfig {
    fn backoff(&self, attempt: u32, err: &LlmError) -> Duration {
        if let LlmError::RateLimited { retry_after_ms } = err {
            return Duration::from_millis(*retry_after_ms).min(self.max_backoff);
        }
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// 对可重试错误做指数退避重试的包装客户端
///
/// 流式调用只重试建立连接阶段；流开始后的错误原样交给调用方。
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn wait_before_retry(&self, attempt: u32, err: &LlmError) -> bool {
        if !err.is_retryable() || attempt >= self.config.max_retries {
            return false;
        }
        let delay = self.config.backoff(attempt, err);
        tracing::warn!(attempt = attempt + 1, ?delay, error = %err, "retrying LLM call");
        tokio::time::sleep(delay).await;
        true
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn chat(&self, messages: &[Message], tools: &[ToolMetadata]) -> Result<Message, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.chat(messages, tools).await {
                Ok(m) => return Ok(m),
                Err(e) => {
                    if !self.wait_before_retry(attempt, &e).await {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolMetadata],
    ) -> Result<ChatStream, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.chat_stream(messages, tools).await {
                Ok(s) => return Ok(s),
                Err(e) => {
                    if !self.wait_before_retry(attempt, &e).await {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(prompt).await {
                Ok(s) => return Ok(s),
                Err(e) => {
                    if !self.wait_before_retry(attempt, &e).await {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn context_window(&self) -> usize {
        self.inner.context_window()
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}
