//! Vercel AI data stream 适配器
//!
//! 把一次运行的进度事件与最终结果合并成一个按真实发生顺序交错的帧流：
//! - 文本：`0:"<json 转义 token>"\n`
//! - 数据：`8:[{...}]\n`（进度事件、sources、追问建议）
//!
//! 第一帧总是空文本帧。结果分支结束后对事件流 `mark_done()`，读完缓冲事件后整个流结束。
//! 后台任务负责合并，通过有界通道交给消费方；消费方丢弃流即视为客户端断开，运行会被取消。

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use crate::chat::suggestion::NextQuestionSuggester;
use crate::core::AgentError;
use crate::memory::Message;
use crate::tools::{NodeWithScore, ToolOutput};
use crate::workflow::{AgentOutput, AgentRunEvent, EventStream, WorkflowHandler};

pub const TEXT_PREFIX: &str = "0:";
pub const DATA_PREFIX: &str = "8:";

const DEFAULT_FRAME_BUFFER: usize = 64;

pub fn text_frame(token: &str) -> String {
    format!("{TEXT_PREFIX}{}\n", Value::String(token.to_string()))
}

/// 数据帧：单元素 JSON 数组
pub fn data_frame(payload: &Value) -> String {
    format!("{DATA_PREFIX}[{payload}]\n")
}

pub fn agent_event_payload(event: &AgentRunEvent) -> Value {
    json!({
        "type": "agent",
        "data": { "agent": event.agent_name, "text": event.message },
    })
}

/// 检索工具的 raw_output 是节点列表，直接展开；其他工具输出各作为一个节点
pub fn source_nodes(sources: &[ToolOutput]) -> Vec<Value> {
    let mut nodes = Vec::new();
    for output in sources {
        match serde_json::from_value::<Vec<NodeWithScore>>(output.raw_output.clone()) {
            Ok(found) => nodes.extend(found.into_iter().map(|n| json!(n))),
            Err(_) => nodes.push(json!({
                "id": output.call_id,
                "text": output.content,
                "score": Value::Null,
                "metadata": { "tool_name": output.tool_name },
            })),
        }
    }
    nodes
}

pub fn sources_payload(sources: &[ToolOutput]) -> Value {
    json!({ "type": "sources", "data": { "nodes": source_nodes(sources) } })
}

pub fn suggested_questions_payload(questions: &[String]) -> Value {
    json!({ "type": "suggested_questions", "data": questions })
}

/// 流的附加输出选项
#[derive(Clone)]
pub struct StreamOptions {
    /// 客户端发来的对话（含本轮问题），用于追问建议
    pub history: Vec<Message>,
    pub suggester: Option<NextQuestionSuggester>,
    pub frame_buffer: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            history: Vec::new(),
            suggester: None,
            frame_buffer: DEFAULT_FRAME_BUFFER,
        }
    }
}

/// 合并后的帧流；丢弃即取消运行
pub struct VercelStream {
    rx: mpsc::Receiver<String>,
    _cancel_on_drop: DropGuard,
}

impl Stream for VercelStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub fn vercel_stream(handler: WorkflowHandler, options: StreamOptions) -> VercelStream {
    let guard = handler.cancellation_token().drop_guard();
    let (tx, rx) = mpsc::channel(options.frame_buffer.max(1));
    tokio::spawn(pump(handler, tx, options));
    VercelStream {
        rx,
        _cancel_on_drop: guard,
    }
}

enum StopReason {
    ClientGone,
    Failed(AgentError),
}

async fn pump(mut handler: WorkflowHandler, tx: mpsc::Sender<String>, options: StreamOptions) {
    let mut events = handler.stream_events();
    match forward(&mut handler, &mut events, &tx, &options).await {
        Ok(()) => {}
        Err(StopReason::ClientGone) => {
            tracing::info!("Stopping workflow");
            handler.cancel();
        }
        Err(StopReason::Failed(e)) if e.is_cancellation() => {
            tracing::info!("Stopping workflow");
        }
        Err(StopReason::Failed(e)) => {
            tracing::error!(error = %e, "Unexpected error in workflow stream");
        }
    }
    tracing::info!("The stream has been stopped!");
}

async fn send(tx: &mpsc::Sender<String>, frame: String) -> Result<(), StopReason> {
    tx.send(frame).await.map_err(|_| StopReason::ClientGone)
}

/// 事件流已结束（或不存在）时永远挂起，让 select 只等其他分支
async fn next_event(events: &mut Option<EventStream>) -> Option<AgentRunEvent> {
    match events {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn forward_event(
    event: Option<AgentRunEvent>,
    events: &mut Option<EventStream>,
    tx: &mpsc::Sender<String>,
) -> Result<(), StopReason> {
    match event {
        Some(ev) => {
            tracing::debug!(agent = %ev.agent_name, text = %ev.message, "agent event");
            send(tx, data_frame(&agent_event_payload(&ev))).await
        }
        None => {
            *events = None;
            Ok(())
        }
    }
}

async fn forward(
    handler: &mut WorkflowHandler,
    events: &mut Option<EventStream>,
    tx: &mpsc::Sender<String>,
    options: &StreamOptions,
) -> Result<(), StopReason> {
    send(tx, text_frame("")).await?;

    // 等待结果期间优先转发已到达的事件
    let output = loop {
        tokio::select! {
            biased;
            _ = tx.closed() => return Err(StopReason::ClientGone),
            ev = next_event(events) => forward_event(ev, events, tx).await?,
            res = &mut *handler => break res.map_err(StopReason::Failed)?,
        }
    };

    let sources = output.sources().to_vec();
    let mut final_text = String::new();
    match output {
        AgentOutput::Complete(result) => {
            final_text = result.final_message.content;
            if !final_text.is_empty() {
                send(tx, text_frame(&final_text)).await?;
            }
        }
        AgentOutput::Streaming { mut tokens, .. } => loop {
            tokio::select! {
                biased;
                _ = tx.closed() => return Err(StopReason::ClientGone),
                ev = next_event(events) => forward_event(ev, events, tx).await?,
                token = tokens.next() => match token {
                    Some(Ok(delta)) => {
                        final_text.push_str(&delta);
                        send(tx, text_frame(&delta)).await?;
                    }
                    Some(Err(e)) => return Err(StopReason::Failed(e)),
                    None => break,
                },
            }
        },
    }

    if !sources.is_empty() {
        send(tx, data_frame(&sources_payload(&sources))).await?;
    }

    if let Some(suggester) = &options.suggester {
        let questions = tokio::select! {
            biased;
            _ = tx.closed() => return Err(StopReason::ClientGone),
            questions = suggester.suggest(&options.history, &final_text) => questions,
        };
        if let Some(questions) = questions {
            send(tx, data_frame(&suggested_questions_payload(&questions))).await?;
        }
    }

    if let Some(mut stream) = events.take() {
        stream.mark_done();
        while let Some(ev) = stream.recv().await {
            send(tx, data_frame(&agent_event_payload(&ev))).await?;
        }
    }
    Ok(())
}
