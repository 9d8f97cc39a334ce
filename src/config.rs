//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RAGENT__*` 覆盖（双下划线表示嵌套，如 `RAGENT__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::workflow::DispatchPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub workflow: WorkflowSection,
    pub chat: ChatSection,
    /// `[[agents]]`：参与对话的 Agent 列表
    pub agents: Vec<AgentConfig>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// ragent-web 监听端口
    pub port: u16,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "ragent".to_string(),
            port: 8000,
        }
    }
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock；缺少对应 API Key 时回退 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub context_window: usize,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            context_window: 4096,
            request_timeout_secs: 60,
            max_retries: 2,
        }
    }
}

/// [agent] 段：单 Agent 工具循环
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_tool_iterations: usize,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub max_concurrent_tools: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_tool_iterations: 20,
            tool_timeout_secs: 30,
            max_concurrent_tools: 3,
        }
    }
}

/// [workflow] 段：编排器
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub timeout_secs: u64,
    pub refine_plan: bool,
    pub dispatch_policy: DispatchPolicy,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            timeout_secs: 360,
            refine_plan: false,
            dispatch_policy: DispatchPolicy::FirstReady,
        }
    }
}

/// [chat] 段：系统提示、追问建议、引用与检索
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatSection {
    pub system_prompt: Option<String>,
    pub suggest_next_questions: bool,
    /// 未设置时用内置提示
    pub next_question_prompt: Option<String>,
    pub inline_citations: bool,
    /// 未设置时用内置引用提示
    pub system_citation_prompt: Option<String>,
    pub top_k: usize,
    /// 检索用的 markdown 知识文件（按 `## ` 分段）
    pub knowledge_file: Option<PathBuf>,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            system_prompt: None,
            suggest_next_questions: true,
            next_question_prompt: None,
            inline_citations: false,
            system_citation_prompt: None,
            top_k: 3,
            knowledge_file: None,
        }
    }
}

/// [[agents]] 条目
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub role: String,
    pub goal: String,
    pub system_prompt: Option<String>,
    /// 工具名：echo / query
    pub tools: Vec<String>,
    pub enabled: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "assistant".to_string(),
            role: String::new(),
            goal: String::new(),
            system_prompt: None,
            tools: Vec::new(),
            enabled: true,
        }
    }
}

/// 从 config 目录加载配置，环境变量 RAGENT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RAGENT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RAGENT")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置；调用方决定是否用新配置重建 LLM 与 Agent
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
