//! 结构化预测：让 LLM 按 JSON Schema 输出，再反序列化为目标类型
//!
//! Schema 由 schemars 生成并拼入 prompt；回复中的 JSON 取自 ```json 代码块，
//! 没有代码块时取第一个 `{` 到最后一个 `}`。解析失败一律视为 Validation 错误。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::llm::{LlmClient, LlmError};

#[derive(Error, Debug)]
pub enum StructuredError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// 模型输出不符合 schema
    #[error("Validation error: {0}")]
    Validation(String),
}

/// 返回类型 T 的 JSON Schema（pretty 格式）
pub fn schema_json<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 从模型回复中截取 JSON 文本
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// 结构化预测：prompt + schema → LLM → T
pub async fn structured_predict<T>(llm: &dyn LlmClient, prompt: &str) -> Result<T, StructuredError>
where
    T: DeserializeOwned + JsonSchema,
{
    let full_prompt = format!(
        "{}\n\nRespond only with a JSON object that conforms to this JSON schema:\n```json\n{}\n```",
        prompt,
        schema_json::<T>()
    );
    let reply = llm.complete(&full_prompt).await?;
    let json = extract_json(&reply)
        .ok_or_else(|| StructuredError::Validation("no JSON object in output".to_string()))?;
    serde_json::from_str(json).map_err(|e| StructuredError::Validation(e.to_string()))
}
