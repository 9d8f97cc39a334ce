//! ragent Web API
//!
//! 启动: cargo run --bin ragent-web --features web
//! - POST /api/chat：Vercel AI data stream（流式）
//! - POST /api/chat/request：一次性返回 `{result, nodes}`
//! - POST /api/config/reload：重新加载配置并重建 LLM 与检索库

#![cfg(feature = "web")]

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use ragent::agent::{create_chat_engine, create_suggester, load_retriever, workflow_timeout};
use ragent::chat::{source_nodes, vercel_stream, StreamOptions};
use ragent::config::{load_config, reload_config, AppConfig};
use ragent::core::AgentError;
use ragent::llm::{create_llm_from_config, LlmClient};
use ragent::memory::{Message, Role};
use ragent::tools::QueryEngine;
use ragent::{observability, spawn_workflow, ChatEngine};

/// 可热更新的运行时组件
struct Runtime {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    retriever: Arc<dyn QueryEngine>,
}

impl Runtime {
    fn from_config(config: AppConfig) -> Self {
        let llm = create_llm_from_config(&config.llm);
        let retriever = load_retriever(&config.chat);
        Self {
            config,
            llm,
            retriever,
        }
    }
}

struct AppState {
    runtime: RwLock<Arc<Runtime>>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: Role,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatResult {
    result: Message,
    nodes: Vec<Value>,
}

type ApiError = (StatusCode, String);

/// 最后一条必须是用户消息；返回（本轮问题，之前的历史）
fn split_request(req: ChatRequest) -> Result<(String, Vec<Message>), ApiError> {
    let mut messages: Vec<Message> = req
        .messages
        .into_iter()
        .map(|m| match m.role {
            Role::Assistant => Message::assistant(m.content),
            Role::System => Message::system(m.content),
            _ => Message::user(m.content),
        })
        .collect();
    match messages.pop() {
        Some(last) if last.role == Role::User => Ok((last.content, messages)),
        Some(_) => Err((
            StatusCode::BAD_REQUEST,
            "Last message must be from user".to_string(),
        )),
        None => Err((StatusCode::BAD_REQUEST, "No messages provided".to_string())),
    }
}

fn build_engine(runtime: &Runtime, history: Vec<Message>) -> Result<ChatEngine, ApiError> {
    create_chat_engine(
        &runtime.config,
        Arc::clone(&runtime.llm),
        Arc::clone(&runtime.retriever),
        history,
    )
    .map_err(engine_error)
}

fn engine_error(e: AgentError) -> ApiError {
    tracing::error!(error = %e, "chat engine failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Error in chat engine: {}", e),
    )
}

/// POST /api/chat：合并事件与回答的帧流；客户端断开（body 被丢弃）即取消运行
async fn api_chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let runtime = Arc::clone(&*state.runtime.read().await);
    let (input, history) = split_request(req)?;
    let engine = build_engine(&runtime, history.clone())?;
    tracing::info!(engine = engine.kind(), "chat request");

    let handler = spawn_workflow(
        engine.into_workflow(),
        input.clone(),
        true,
        workflow_timeout(&runtime.config),
    );
    let mut full_history = history;
    full_history.push(Message::user(input));
    let options = StreamOptions {
        history: full_history,
        suggester: create_suggester(&runtime.config.chat, Arc::clone(&runtime.llm)),
        ..StreamOptions::default()
    };
    let frames = vercel_stream(handler, options).map(|frame| Ok::<_, Infallible>(Bytes::from(frame)));

    let mut res = Response::new(Body::from_stream(frames));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res.headers_mut()
        .insert("X-Vercel-AI-Data-Stream", HeaderValue::from_static("v1"));
    Ok(res)
}

/// POST /api/chat/request：非流式
async fn api_chat_request(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResult>, ApiError> {
    let runtime = Arc::clone(&*state.runtime.read().await);
    let (input, history) = split_request(req)?;
    let engine = build_engine(&runtime, history)?;

    let handler = spawn_workflow(
        engine.into_workflow(),
        input,
        false,
        workflow_timeout(&runtime.config),
    );
    let output = handler.await.map_err(engine_error)?;
    let result = output.into_result().await.map_err(engine_error)?;
    Ok(Json(ChatResult {
        nodes: source_nodes(&result.sources),
        result: result.final_message,
    }))
}

/// POST /api/config/reload
async fn api_config_reload(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    let config = reload_config().map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    *state.runtime.write().await = Arc::new(Runtime::from_config(config));
    tracing::info!("config reloaded");
    Ok(StatusCode::OK)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });
    let port = std::env::var("RAGENT_WEB_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(cfg.app.port);

    let state = Arc::new(AppState {
        runtime: RwLock::new(Arc::new(Runtime::from_config(cfg))),
    });

    let app = Router::new()
        .route("/api/chat", post(api_chat))
        .route("/api/chat/request", post(api_chat_request))
        .route("/api/config/reload", post(api_config_reload))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("ragent Web API: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
