//! Echo 工具（测试 / 演示用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::{input_schema, parse_args};
use crate::tools::{Tool, ToolContext, ToolResponse};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EchoArgs {
    /// 要回显的文本
    pub text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back unchanged (for testing)."
    }

    fn parameters_schema(&self) -> Value {
        input_schema::<EchoArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResponse, String> {
        let args: EchoArgs = parse_args(self.name(), args)?;
        Ok(ToolResponse::text(args.text))
    }
}
