//! 工具参数 JSON Schema 生成（schemars）
//!
//! 每个工具把参数定义成一个 `#[derive(JsonSchema, Deserialize)]` 结构体，
//! parameters_schema 直接由它生成，保证描述给 LLM 的格式与实际反序列化一致。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// 生成参数结构体的 JSON Schema（去掉 `$schema` / `title` 元字段）
pub fn input_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// 把 tool call 的 JSON 参数解析为参数结构体；失败时返回可读的错误文本
pub fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments for {}: {}", tool, e))
}
