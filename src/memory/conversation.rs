//! 短期记忆：对话历史
//!
//! 按插入顺序保存带角色的消息；可选 token 预算，超出时按 FIFO 淘汰最旧的非 system 消息，
//! system 消息永不淘汰，供 LLM 上下文与流式响应使用。

use serde::{Deserialize, Serialize};

use crate::memory::token_budget::{TokenBudget, TokenEstimator};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// LLM 返回的工具调用：工具名、调用 ID、参数（JSON 对象）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub call_id: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        tool_name: impl Into<String>,
        call_id: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            call_id: call_id.into(),
            arguments,
        }
    }
}

/// 单条消息
///
/// `tool_call_id` / `tool_name` 仅 Tool 消息使用；`tool_calls` 仅 Assistant 消息使用
/// （回放给 function-calling API 时需要与随后的 Tool 消息配对）。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// 工具结果消息，携带原始调用的 call_id 与工具名
    pub fn tool(
        content: impl Into<String>,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    /// 请求调用工具的 Assistant 消息
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 对话记忆：append-only 的有序消息序列，可选 token 上限
#[derive(Clone, Debug, Default)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    token_limit: Option<usize>,
}

impl ConversationMemory {
    /// 无上限的对话记忆
    pub fn new() -> Self {
        Self::default()
    }

    /// 以 token 预算（context_window - reserved_margin）为上限
    pub fn with_budget(budget: TokenBudget) -> Self {
        Self {
            messages: Vec::new(),
            token_limit: Some(budget.limit()),
        }
    }

    /// 以既有历史初始化（历史同样受预算约束）
    pub fn with_history(mut self, history: impl IntoIterator<Item = Message>) -> Self {
        for msg in history {
            self.append(msg);
        }
        self
    }

    pub fn append(&mut self, msg: Message) {
        self.messages.push(msg);
        self.trim();
    }

    /// 当前对话（按插入顺序）；两次 append 之间多次调用结果相同
    pub fn get(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn has_system(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::System)
    }

    /// 尚无 system 消息时插入到最前；已有则不变
    pub fn ensure_system(&mut self, content: &str) {
        if !self.has_system() {
            self.messages.insert(0, Message::system(content));
            self.trim();
        }
    }

    pub fn token_limit(&self) -> Option<usize> {
        self.token_limit
    }

    pub fn token_count(&self) -> usize {
        TokenEstimator::estimate_messages(&self.messages)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 超出上限时按"单元"淘汰最旧的非 system 消息
    ///
    /// 带 tool_calls 的 Assistant 消息与其后紧随的 Tool 消息构成一个单元，整体淘汰，
    /// 保证回放给 function-calling API 时不会出现孤立的 Tool 消息。
    /// 最新的 User 消息（当前问题）与最后一个单元始终保留。
    fn trim(&mut self) {
        let Some(limit) = self.token_limit else {
            return;
        };
        let mut total = self.token_count();
        while total > limit {
            let Some((start, end)) = self.oldest_evictable_unit() else {
                break;
            };
            let evicted: Vec<Message> = self.messages.drain(start..end).collect();
            total = total.saturating_sub(TokenEstimator::estimate_messages(&evicted));
            tracing::debug!(
                role = ?evicted[0].role,
                count = evicted.len(),
                total,
                limit,
                "evicted messages from memory"
            );
        }
    }

    /// 最旧的可淘汰单元 `[start, end)`
    fn oldest_evictable_unit(&self) -> Option<(usize, usize)> {
        let len = self.messages.len();
        let latest_user = self.messages.iter().rposition(|m| m.role == Role::User);
        let mut start = 0;
        while start < len {
            if self.messages[start].role == Role::System {
                start += 1;
                continue;
            }
            let end = self.unit_end(start);
            let holds_question = latest_user.is_some_and(|u| (start..end).contains(&u));
            if end < len && !holds_question {
                return Some((start, end));
            }
            start = end;
        }
        None
    }

    fn unit_end(&self, start: usize) -> usize {
        let head = &self.messages[start];
        let mut end = start + 1;
        if head.has_tool_calls() || head.role == Role::Tool {
            while self
                .messages
                .get(end)
                .is_some_and(|m| m.role == Role::Tool)
            {
                end += 1;
            }
        }
        end
    }
}
