//! 记忆层：对话历史与 token 预算

pub mod conversation;
pub mod token_budget;

pub use conversation::{ConversationMemory, Message, Role, ToolCall};
pub use token_budget::{TokenBudget, TokenEstimator, DEFAULT_RESERVED_MARGIN};
