//! 工具层：Tool trait、注册表、执行器与内置工具（echo / 检索 / 子 Agent 委托）

pub mod agent_call;
pub mod echo;
pub mod executor;
pub mod query;
pub mod registry;
pub mod schema;

pub use agent_call::AgentCallTool;
pub use echo::EchoTool;
pub use executor::{ToolExecutor, TOOL_ERROR_PREFIX};
pub use query::{
    format_nodes, Document, KeywordRetriever, NodeWithScore, QueryEngine, QueryTool, QUERY_TOOL_NAME,
};
pub use registry::{Tool, ToolContext, ToolMetadata, ToolOutput, ToolRegistry, ToolResponse};
pub use schema::{input_schema, parse_args};
