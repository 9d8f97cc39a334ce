//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 function calling 与流式，
//! DeepSeek、OpenAI、自建代理均可。

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionMessageToolCallChunk, CreateChatCompletionRequest,
    CreateChatCompletionStreamResponse,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use serde_json::{json, Value};

use crate::llm::{ChatChunk, ChatStream, LlmClient, LlmError};
use crate::memory::{Message, Role, ToolCall};
use crate::tools::ToolMetadata;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";

/// 连接建立的超时
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
///
/// `timeout` 约束非流式请求的整体时长，以及流式响应中相邻两个 chunk 的间隔；
/// 流式响应的总时长不设上限，持续输出的长回答不会被截断。
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Option<Duration>,
    context_window: usize,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url.trim_end_matches('/'))
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout: None,
            context_window: 4096,
            usage: TokenUsage::new(),
        }
    }

    /// DeepSeek 预设：base_url 固定，Key 取自 DEEPSEEK_API_KEY
    pub fn deepseek(model: &str) -> Self {
        let key = std::env::var("DEEPSEEK_API_KEY").ok();
        Self::new(Some(DEEPSEEK_BASE_URL), model, key.as_deref())
    }

    /// 非流式请求的整体超时，同时作为流式响应的空闲超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        match reqwest::Client::builder()
            .connect_timeout(timeout.min(DEFAULT_CONNECT_TIMEOUT))
            .build()
        {
            Ok(http) => self.client = self.client.with_http_client(http),
            Err(e) => tracing::warn!(error = %e, "failed to build HTTP client, using default"),
        }
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context_window(mut self, context_window: usize) -> Self {
        self.context_window = context_window;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// 组装请求：消息与工具先按 OpenAI 协议写成 JSON，再解析为 async_openai 的请求类型
    fn request(
        &self,
        messages: &[Message],
        tools: &[ToolMetadata],
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, LlmError> {
        let mut payload = json!({
            "model": self.model,
            "messages": messages.iter().map(message_to_wire).collect::<Vec<_>>(),
            "stream": stream,
        });
        if stream {
            payload["stream_options"] = json!({ "include_usage": true });
        }
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.iter().map(tool_to_wire).collect());
        }
        serde_json::from_value(payload)
            .map_err(|e| LlmError::ApiError(format!("invalid chat request: {}", e)))
    }
}

/// 429 由 async_openai 内部退避重试；这里只区分网络类（可重试）与其他错误
fn map_openai_error(err: OpenAIError) -> LlmError {
    match err {
        e @ (OpenAIError::Reqwest(..) | OpenAIError::StreamError(..)) => {
            LlmError::Network(e.to_string())
        }
        OpenAIError::ApiError(e) => LlmError::ApiError(e.message),
        e @ OpenAIError::JSONDeserialize(..) => LlmError::InvalidResponse(e.to_string()),
        other => LlmError::ApiError(other.to_string()),
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn message_to_wire(m: &Message) -> Value {
    let mut wire = json!({
        "role": role_str(m.role),
        "content": m.content,
    });
    if m.role == Role::Tool {
        if let Some(id) = &m.tool_call_id {
            wire["tool_call_id"] = json!(id);
        }
    }
    if m.has_tool_calls() {
        wire["tool_calls"] = Value::Array(
            m.tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.call_id,
                        "type": "function",
                        "function": {
                            "name": c.tool_name,
                            "arguments": c.arguments.to_string(),
                        }
                    })
                })
                .collect(),
        );
    }
    wire
}

fn tool_to_wire(t: &ToolMetadata) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": t.name,
            "description": t.description,
            "parameters": t.parameters,
        }
    })
}

/// 模型给出的 arguments 是 JSON 字符串；解析失败时保留原文，由工具自行报错
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// 响应中的 tool_calls 按协议格式（`id` + `function.name` + `function.arguments`）读取
fn parse_tool_calls(calls: &Value) -> Vec<ToolCall> {
    calls
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    let id = c.get("id")?.as_str()?;
                    let function = c.get("function")?;
                    let name = function.get("name")?.as_str()?;
                    let args = function
                        .get("arguments")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    Some(ToolCall::new(name, id, parse_arguments(args)))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn assistant_message(content: String, calls: Vec<ToolCall>) -> Message {
    if calls.is_empty() {
        Message::assistant(content)
    } else {
        Message::assistant_tool_calls(content, calls)
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// 流式增量累积器：文本增量拼接，tool_calls 按 index 合并
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    calls: Vec<PartialCall>,
}

impl StreamAccumulator {
    /// 合并一个 delta，返回其中的文本增量
    fn apply(
        &mut self,
        content: Option<&str>,
        calls: &[ChatCompletionMessageToolCallChunk],
    ) -> String {
        let text = content.unwrap_or_default().to_string();
        self.content.push_str(&text);

        for call in calls {
            let index = call.index as usize;
            while self.calls.len() <= index {
                self.calls.push(PartialCall::default());
            }
            let slot = &mut self.calls[index];
            if let Some(id) = &call.id {
                slot.id = id.clone();
            }
            if let Some(function) = &call.function {
                if let Some(name) = &function.name {
                    slot.name.push_str(name);
                }
                if let Some(args) = &function.arguments {
                    slot.arguments.push_str(args);
                }
            }
        }
        text
    }

    fn message(&self) -> Message {
        let calls = self
            .calls
            .iter()
            .map(|c| ToolCall::new(&c.name, &c.id, parse_arguments(&c.arguments)))
            .collect();
        assistant_message(self.content.clone(), calls)
    }
}

type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<CreateChatCompletionStreamResponse, OpenAIError>> + Send>>;

struct StreamState {
    inner: ResponseStream,
    acc: StreamAccumulator,
    usage: TokenUsage,
    idle_timeout: Option<Duration>,
    finished: bool,
}

impl StreamState {
    /// 下一个含 delta 的 chunk；只带 usage 的尾包记账后跳过
    async fn next_chunk(&mut self) -> Option<Result<ChatChunk, LlmError>> {
        loop {
            let next = match self.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.inner.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        return Some(Err(LlmError::Network(format!(
                            "stream stalled for {:?}",
                            limit
                        ))))
                    }
                },
                None => self.inner.next().await,
            };
            let response = match next? {
                Ok(response) => response,
                Err(e) => return Some(Err(map_openai_error(e))),
            };
            if let Some(usage) = &response.usage {
                self.usage
                    .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
            }
            let Some(choice) = response.choices.first() else {
                continue;
            };
            let delta = &choice.delta;
            let text = self.acc.apply(
                delta.content.as_deref(),
                delta.tool_calls.as_deref().unwrap_or_default(),
            );
            return Some(Ok(ChatChunk {
                delta: text,
                message: self.acc.message(),
            }));
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, messages: &[Message], tools: &[ToolMetadata]) -> Result<Message, LlmError> {
        let request = self.request(messages, tools, false)?;
        let chat = self.client.chat();
        let call = chat.create(request);
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| LlmError::Network(format!("request timed out after {:?}", limit)))?,
            None => call.await,
        }
        .map_err(map_openai_error)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No message in choices".to_string()))?;
        let calls = serde_json::to_value(&choice.message.tool_calls)
            .map(|v| parse_tool_calls(&v))
            .unwrap_or_default();
        Ok(assistant_message(
            choice.message.content.unwrap_or_default(),
            calls,
        ))
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolMetadata],
    ) -> Result<ChatStream, LlmError> {
        let request = self.request(messages, tools, true)?;
        let inner = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(map_openai_error)?;

        let state = StreamState {
            inner,
            acc: StreamAccumulator::default(),
            usage: self.usage.clone(),
            idle_timeout: self.timeout,
            finished: false,
        };

        let chunks = stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            let item = state.next_chunk().await?;
            if item.is_err() {
                state.finished = true;
            }
            Some((item, state))
        });

        Ok(Box::pin(chunks))
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        args: &str,
    ) -> ChatCompletionMessageToolCallChunk {
        let mut function = json!({ "arguments": args });
        if let Some(name) = name {
            function["name"] = json!(name);
        }
        let mut raw = json!({ "index": index, "function": function });
        if let Some(id) = id {
            raw["id"] = json!(id);
            raw["type"] = json!("function");
        }
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_tool_call_response_is_parsed() {
        let calls = json!([{
            "id": "call_1",
            "type": "function",
            "function": {"name": "echo", "arguments": "{\"text\":\"hi\"}"}
        }]);
        let calls = parse_tool_calls(&calls);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "echo");
        assert_eq!(calls[0].call_id, "call_1");
        assert_eq!(calls[0].arguments["text"], "hi");
        assert!(parse_tool_calls(&Value::Null).is_empty());
    }

    #[test]
    fn test_accumulator_merges_tool_call_fragments() {
        let mut acc = StreamAccumulator::default();
        acc.apply(None, &[chunk(0, Some("c1"), Some("echo"), "{\"te")]);
        acc.apply(None, &[chunk(0, None, None, "xt\":\"a\"}")]);
        let msg = acc.message();
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].call_id, "c1");
        assert_eq!(msg.tool_calls[0].arguments, json!({"text": "a"}));
    }

    #[test]
    fn test_accumulator_returns_text_delta() {
        let mut acc = StreamAccumulator::default();
        assert_eq!(acc.apply(Some("Hel"), &[]), "Hel");
        assert_eq!(acc.apply(Some("lo"), &[]), "lo");
        let msg = acc.message();
        assert_eq!(msg.content, "Hello");
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn test_request_carries_tools_and_tool_results() {
        let client = OpenAiClient::new(Some("http://localhost:1/v1/"), "gpt-test", Some("sk-test"));
        let tool = ToolMetadata {
            name: "echo".to_string(),
            description: "Echo text".to_string(),
            parameters: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
        };
        let history = vec![
            Message::user("ping"),
            Message::assistant_tool_calls("", vec![ToolCall::new("echo", "call_9", json!({"text": "pong"}))]),
            Message::tool("pong", "call_9", "echo"),
        ];
        let request = client.request(&history, &[tool], true).unwrap();
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["model"], "gpt-test");
        assert_eq!(wire["stream"], true);
        assert_eq!(wire["tools"][0]["function"]["name"], "echo");
        assert_eq!(wire["messages"][1]["tool_calls"][0]["id"], "call_9");
        assert_eq!(wire["messages"][2]["role"], "tool");
        assert_eq!(wire["messages"][2]["tool_call_id"], "call_9");
    }

    #[test]
    fn test_unparseable_arguments_are_kept_raw() {
        assert_eq!(parse_arguments("not json"), Value::String("not json".to_string()));
        assert_eq!(parse_arguments(""), json!({}));
    }
}
