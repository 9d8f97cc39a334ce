//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）、重试、结构化预测

pub mod mock;
pub mod openai;
pub mod structured;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use structured::{extract_json, schema_json, structured_predict, StructuredError};
pub use traits::{ChatChunk, ChatStream, LlmClient, LlmError, RetryConfig, RetryingLlmClient};

use crate::config::LlmSection;

/// 根据 [llm] 配置创建客户端：provider=mock 或缺少 API Key 时回退到 Mock
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let timeout = Duration::from_secs(cfg.request_timeout_secs);

    let client: OpenAiClient = match provider.as_str() {
        "deepseek" if std::env::var("DEEPSEEK_API_KEY").is_ok() => {
            tracing::info!("Using DeepSeek LLM ({})", cfg.model);
            OpenAiClient::deepseek(&cfg.model)
        }
        "openai" if std::env::var("OPENAI_API_KEY").is_ok() => {
            tracing::info!("Using OpenAI LLM ({})", cfg.model);
            OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, None)
        }
        _ => {
            tracing::warn!("No API key set or provider is mock, using Mock LLM");
            return Arc::new(MockLlmClient);
        }
    };

    let client = client
        .with_timeout(timeout)
        .with_context_window(cfg.context_window);
    Arc::new(RetryingLlmClient::new(
        Arc::new(client),
        RetryConfig {
            max_retries: cfg.max_retries,
            ..RetryConfig::default()
        },
    ))
}
