//! ragent - 检索增强的多智能体对话核心
//!
//! 模块划分：
//! - **agent**: 无头运行时（按配置构建 Agent、选择对话引擎）
//! - **chat**: 上下文对话引擎、追问建议、Vercel 流式适配
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与工具并发调度
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、重试、结构化预测
//! - **memory**: 对话记忆与 token 预算
//! - **tools**: 工具 trait、注册表、执行器与内置工具
//! - **workflow**: 单 Agent 工具循环、规划编排器、事件与运行句柄

pub mod agent;
pub mod chat;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
pub mod workflow;

pub use agent::{create_chat_engine, ChatEngine};
pub use workflow::{spawn_workflow, AgentWorkflow, WorkflowHandler};
