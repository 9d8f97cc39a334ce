//! Token 预算控制
//!
//! 底层 LLM 有硬性输入上限：对话记忆的可用额度为 context_window - reserved_margin，
//! 超出时宁可丢弃最旧的轮次，也不让请求失败。

use crate::memory::Message;

/// 默认预留的安全余量（token）
pub const DEFAULT_RESERVED_MARGIN: usize = 256;

/// 每条消息的角色/分隔符开销估算
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 单条消息：内容 + 工具调用参数 + 固定开销
    pub fn estimate_message(msg: &Message) -> usize {
        let calls: usize = msg
            .tool_calls
            .iter()
            .map(|c| Self::estimate(&c.tool_name) + Self::estimate(&c.arguments.to_string()))
            .sum();
        Self::estimate(&msg.content) + calls + MESSAGE_OVERHEAD_TOKENS
    }

    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages.iter().map(Self::estimate_message).sum()
    }
}

/// 对话记忆的 token 预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    context_window: usize,
    reserved_margin: usize,
}

impl TokenBudget {
    pub fn new(context_window: usize) -> Self {
        Self {
            context_window,
            reserved_margin: DEFAULT_RESERVED_MARGIN,
        }
    }

    pub fn with_reserved_margin(mut self, margin: usize) -> Self {
        self.reserved_margin = margin;
        self
    }

    /// 对话可用的 token 上限
    pub fn limit(&self) -> usize {
        self.context_window.saturating_sub(self.reserved_margin)
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(4096)
    }
}
