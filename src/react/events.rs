//! 流式事件：token / tool_call / tool_start / tool_result / done / error
//!
//! 每个事件带毫秒时间戳与会话 id；一次调用的事件流总以恰好一个 done 或 error 结束。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::llm::TokenUsage;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// 模型增量文本
    Token { text: String },
    /// 去重后接受的工具调用提议
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// 即将执行工具
    ToolStart { id: String, name: String },
    ToolResult {
        id: String,
        name: String,
        success: bool,
        payload: serde_json::Value,
    },
    Done {
        content: String,
        tools_used: Vec<String>,
        tool_rounds: u32,
        total_usage: TokenUsage,
    },
    Error { kind: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub conversation_id: String,
    pub timestamp_ms: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Done { .. } | EventKind::Error { .. })
    }
}

/// 事件出口：可选的 mpsc 发送端 + 会话 id；接收端关闭后静默丢弃
#[derive(Clone)]
pub struct EventSink {
    conversation_id: String,
    tx: Option<UnboundedSender<StreamEvent>>,
}

impl EventSink {
    pub fn new(conversation_id: impl Into<String>, tx: Option<UnboundedSender<StreamEvent>>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            tx,
        }
    }

    pub fn silent(conversation_id: impl Into<String>) -> Self {
        Self::new(conversation_id, None)
    }

    pub fn emit(&self, kind: EventKind) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(StreamEvent {
                conversation_id: self.conversation_id.clone(),
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                kind,
            });
        }
    }
}
