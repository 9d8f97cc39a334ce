//! 进度事件通道
//!
//! 每次运行创建一对 (EventSink, EventStream)。子 Agent 拿到父级 EventSink 的克隆，
//! 直接写入父级通道（事件冒泡），因此子事件天然按产生顺序出现在父级流中。
//! 事件源没有自然结束点：结果分支完成后由消费方调用 `mark_done()` 关闭接收端，
//! 已缓冲的事件仍会被读完。

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

/// 运行中的进度事件（仅用于流式展示，不持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRunEvent {
    pub agent_name: String,
    pub message: String,
}

impl AgentRunEvent {
    pub fn new(agent_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            message: message.into(),
        }
    }
}

/// 事件写入端；noop 时丢弃所有事件
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<AgentRunEvent>>,
}

impl EventSink {
    pub fn channel() -> (EventSink, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx: Some(tx) }, EventStream { rx })
    }

    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// 接收端已关闭时静默丢弃
    pub fn write(&self, event: AgentRunEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn emit(&self, agent_name: &str, message: impl Into<String>) {
        self.write(AgentRunEvent::new(agent_name, message));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// 事件读取端
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<AgentRunEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<AgentRunEvent> {
        self.rx.recv().await
    }

    /// 标记事件源结束：不再接受新事件，缓冲区读完后流结束
    pub fn mark_done(&mut self) {
        self.rx.close();
    }

    /// 非阻塞地取出当前已缓冲的全部事件
    pub fn drain_ready(&mut self) -> Vec<AgentRunEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.rx.try_recv() {
            out.push(ev);
        }
        out
    }
}

impl Stream for EventStream {
    type Item = AgentRunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (sink, mut events) = EventSink::channel();
        let child = sink.clone();
        sink.emit("parent", "one");
        child.emit("child", "two");
        sink.emit("parent", "three");
        let got: Vec<String> = events.drain_ready().into_iter().map(|e| e.message).collect();
        assert_eq!(got, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_mark_done_drains_then_ends() {
        let (sink, mut events) = EventSink::channel();
        sink.emit("a", "buffered");
        events.mark_done();
        sink.emit("a", "dropped");
        assert!(sink.is_closed());
        assert_eq!(events.next().await.map(|e| e.message), Some("buffered".to_string()));
        assert!(events.next().await.is_none());
    }

    #[test]
    fn test_noop_sink_discards() {
        let sink = EventSink::noop();
        sink.emit("a", "x");
        assert!(sink.is_closed());
    }
}
